//! Hardware task-watchdog gatekeeper.
//!
//! The node's liveness contract is one feed per loop iteration, for as
//! long as the network feed policy allows it. The deadline is not a
//! magic number: the composition root derives it from its own loop
//! budget, so a slower board profile stretches the watchdog with it.
//! Withheld feeds are tallied for diagnostics — enough of them in a
//! row and the chip resets itself, which is exactly the point.

pub struct Watchdog {
    timeout_ms: u32,
    /// Feeds withheld by the feed policy since boot.
    withheld: u32,
    #[cfg(target_os = "espidf")]
    armed: bool,
}

impl Watchdog {
    /// Arm the task watchdog with a deadline derived from the caller's
    /// iteration budget. On the host only the bookkeeping remains.
    pub fn arm(timeout_ms: u32) -> Self {
        Self {
            timeout_ms,
            withheld: 0,
            #[cfg(target_os = "espidf")]
            armed: subscribe_current_task(timeout_ms),
        }
    }

    /// Per-iteration service: feeds when `may_feed` holds, otherwise
    /// records the withheld feed and lets the deadline run. Returns
    /// whether a feed actually happened.
    pub fn service(&mut self, may_feed: bool) -> bool {
        if !may_feed {
            self.withheld = self.withheld.saturating_add(1);
            return false;
        }

        #[cfg(target_os = "espidf")]
        if self.armed {
            // SAFETY: resets only our own task's watchdog entry.
            unsafe {
                esp_idf_svc::sys::esp_task_wdt_reset();
            }
        }
        true
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    /// Feeds withheld since boot (network-loss iterations).
    pub fn withheld(&self) -> u32 {
        self.withheld
    }
}

/// Reconfigure the TWDT to our deadline and enrol the current task.
/// False means the watchdog could not be armed; the node still runs,
/// it just loses the stall backstop.
#[cfg(target_os = "espidf")]
fn subscribe_current_task(timeout_ms: u32) -> bool {
    use esp_idf_svc::sys::*;

    let config = esp_task_wdt_config_t {
        timeout_ms,
        idle_core_mask: 0,
        trigger_panic: true,
    };
    // SAFETY: single-threaded bring-up, before the main loop starts.
    unsafe {
        if esp_task_wdt_reconfigure(&config) != ESP_OK {
            log::warn!("watchdog: reconfigure refused, keeping platform deadline");
        }
        match esp_task_wdt_add(core::ptr::null_mut()) {
            ESP_OK => {
                log::info!("watchdog: armed, {} ms deadline", timeout_ms);
                true
            }
            rc => {
                log::warn!("watchdog: task enrolment refused ({})", rc);
                false
            }
        }
    }
}
