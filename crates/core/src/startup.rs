//! Reachability check run after a successful start
//!
//! A started engine may still fail to bring up its control API (wrong
//! `external-controller`, port in use). That is reported as `Unreachable`,
//! which is not a crash. An engine that exits while it is being checked is
//! neither: the crash path reports it, and the check just gives up.

use std::time::Duration;

use crate::control_api::{ControlApi, EngineVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachabilityPolicy {
    pub attempts: u32,
    /// Sleep before each attempt
    pub delay: Duration,
}

impl Default for ReachabilityPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    Online { version: EngineVersion },
    Unreachable { attempts: u32 },
    /// The engine was gone before the control API answered
    EngineExited { attempts: u32 },
}

/// Poll `get_version` until it answers or the attempts run out.
///
/// `still_running` is asked before every attempt; once it returns false the
/// loop stops without calling the API again.
pub fn wait_until_reachable(
    api: &dyn ControlApi,
    policy: ReachabilityPolicy,
    mut sleep: impl FnMut(Duration),
    mut still_running: impl FnMut() -> bool,
) -> StartupOutcome {
    for attempt in 1..=policy.attempts {
        sleep(policy.delay);
        if !still_running() {
            tracing::info!("Engine exited before its control API answered");
            return StartupOutcome::EngineExited {
                attempts: attempt - 1,
            };
        }
        match api.get_version() {
            Ok(version) => {
                tracing::info!(
                    "Control API online after {} attempt(s): {}",
                    attempt,
                    version.version
                );
                return StartupOutcome::Online { version };
            }
            Err(e) => {
                tracing::warn!(
                    "Control API attempt {}/{} failed: {}",
                    attempt,
                    policy.attempts,
                    e
                );
            }
        }
    }

    tracing::error!("Engine started but control API is unreachable");
    StartupOutcome::Unreachable {
        attempts: policy.attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_api::{ControlApiError, EngineConfigs, ProxyMode};
    use parking_lot::Mutex;

    /// Fails `failures` times, then answers
    struct FlakyApi {
        failures: u32,
        calls: Mutex<u32>,
    }

    impl FlakyApi {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: Mutex::new(0),
            }
        }
    }

    impl ControlApi for FlakyApi {
        fn get_version(&self) -> Result<EngineVersion, ControlApiError> {
            let mut calls = self.calls.lock();
            *calls += 1;
            if *calls <= self.failures {
                return Err(ControlApiError::Status(503));
            }
            Ok(EngineVersion {
                version: "v1.18.0".to_string(),
                premium: false,
            })
        }

        fn get_configs(&self) -> Result<EngineConfigs, ControlApiError> {
            Err(ControlApiError::Status(404))
        }

        fn update_mode(&self, _mode: ProxyMode) -> Result<(), ControlApiError> {
            Ok(())
        }
    }

    fn policy() -> ReachabilityPolicy {
        ReachabilityPolicy {
            attempts: 3,
            delay: Duration::from_millis(1000),
        }
    }

    #[test]
    fn test_online_on_first_answer() {
        let api = FlakyApi::new(1);
        let mut slept = Vec::new();

        let outcome = wait_until_reachable(&api, policy(), |d| slept.push(d), || true);

        assert!(matches!(outcome, StartupOutcome::Online { ref version } if version.version == "v1.18.0"));
        assert_eq!(*api.calls.lock(), 2);
        assert_eq!(slept, vec![Duration::from_millis(1000); 2]);
    }

    #[test]
    fn test_unreachable_after_budget() {
        let api = FlakyApi::new(u32::MAX);
        let mut slept = 0;

        let outcome = wait_until_reachable(&api, policy(), |_| slept += 1, || true);

        assert_eq!(outcome, StartupOutcome::Unreachable { attempts: 3 });
        assert_eq!(*api.calls.lock(), 3);
        assert_eq!(slept, 3);
    }

    #[test]
    fn test_zero_attempts_never_calls() {
        let api = FlakyApi::new(0);
        let outcome = wait_until_reachable(
            &api,
            ReachabilityPolicy {
                attempts: 0,
                delay: Duration::ZERO,
            },
            |_| {},
            || true,
        );

        assert_eq!(outcome, StartupOutcome::Unreachable { attempts: 0 });
        assert_eq!(*api.calls.lock(), 0);
    }

    #[test]
    fn test_stops_polling_once_engine_is_gone() {
        let api = FlakyApi::new(u32::MAX);
        let mut checks = 0;

        let outcome = wait_until_reachable(
            &api,
            policy(),
            |_| {},
            || {
                checks += 1;
                checks == 1
            },
        );

        assert_eq!(outcome, StartupOutcome::EngineExited { attempts: 1 });
        assert_eq!(*api.calls.lock(), 1);
    }
}
