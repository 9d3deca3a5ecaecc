//! IP Rotation
//!
//! Obtains a new external address by cycling the device's transports:
//! everything is turned off, held off for a moment, turned back on, and
//! given time to reattach before returning.

use crate::config::RotationSettings;
use crate::platform::{NetworkControl, PlatformError};
use std::sync::Arc;
use tracing::{info, warn};

/// Rotation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RotationError {
    #[error("Missing permission to change network state")]
    PermissionDenied,

    #[error("Failed to toggle network: {0}")]
    Toggle(#[from] PlatformError),
}

/// Cycles cellular and Wi-Fi transports
pub struct NetworkRotator {
    control: Arc<dyn NetworkControl>,
    settings: RotationSettings,
}

impl NetworkRotator {
    pub fn new(control: Arc<dyn NetworkControl>, settings: RotationSettings) -> Self {
        Self { control, settings }
    }

    /// Disable transports, wait, re-enable, wait
    ///
    /// Both waits always happen, even when a toggle fails; the first
    /// failure is reported after the full cycle.
    pub async fn rotate_ip(&self) -> Result<(), RotationError> {
        info!("Rotating IP: disabling transports");
        let disabled = self.toggle(false);
        tokio::time::sleep(self.settings.disable_hold()).await;

        info!("Rotating IP: re-enabling transports");
        let enabled = self.toggle(true);
        tokio::time::sleep(self.settings.settle()).await;

        disabled.and(enabled)
    }

    fn toggle(&self, enable: bool) -> Result<(), RotationError> {
        let cellular = self.toggle_cellular(enable);
        let wifi = self.toggle_wifi(enable);

        if let Err(e) = &cellular {
            warn!("Cellular toggle failed: {}", e);
        }
        if let Err(e) = &wifi {
            warn!("Wi-Fi toggle failed: {}", e);
        }

        cellular.and(wifi)
    }

    fn toggle_cellular(&self, enable: bool) -> Result<(), RotationError> {
        if !self.control.has_change_network_permission() {
            return Err(RotationError::PermissionDenied);
        }

        if enable {
            self.control.unregister_cellular_interest()?;
        } else {
            self.control.register_cellular_interest()?;
        }
        Ok(())
    }

    fn toggle_wifi(&self, enable: bool) -> Result<(), RotationError> {
        if self.control.can_toggle_wifi() {
            self.control.set_wifi_enabled(enable)?;
        } else {
            // Toggle is left to the user
            self.control.open_connectivity_settings()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockControl;
    use std::time::Duration;
    use tokio::time::Instant;

    fn rotator(control: &Arc<MockControl>) -> NetworkRotator {
        NetworkRotator::new(control.clone(), RotationSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_sequence_and_timing() {
        let control = MockControl::new();
        let start = Instant::now();

        rotator(&control).rotate_ip().await.unwrap();

        assert_eq!(
            control.calls(),
            vec!["register_cellular", "wifi_off", "unregister_cellular", "wifi_on"]
        );
        let hold = control.time_of("wifi_on") - control.time_of("wifi_off");
        assert!(hold >= Duration::from_secs(1));
        assert!(Instant::now() - control.time_of("wifi_on") >= Duration::from_secs(2));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delays_still_wait_minimum() {
        let control = MockControl::new();
        let settings = RotationSettings {
            disable_hold_ms: 0,
            settle_ms: 0,
        };
        let start = Instant::now();

        NetworkRotator::new(control.clone(), settings).rotate_ip().await.unwrap();

        let hold = control.time_of("wifi_on") - control.time_of("wifi_off");
        assert!(hold >= Duration::from_secs(1));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restricted_wifi_opens_settings() {
        let control = MockControl::new();
        control.restrict_wifi();

        rotator(&control).rotate_ip().await.unwrap();

        assert_eq!(
            control.calls(),
            vec!["register_cellular", "open_settings", "unregister_cellular", "open_settings"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_permission_still_cycles_wifi() {
        let control = MockControl::new();
        control.revoke_permission();
        let start = Instant::now();

        let result = rotator(&control).rotate_ip().await;

        assert!(matches!(result, Err(RotationError::PermissionDenied)));
        assert_eq!(control.calls(), vec!["wifi_off", "wifi_on"]);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_failure_waits_full_cycle() {
        let control = MockControl::new();
        control.fail_wifi();
        let start = Instant::now();

        let result = rotator(&control).rotate_ip().await;

        assert!(matches!(result, Err(RotationError::Toggle(_))));
        assert!(control.calls().contains(&"unregister_cellular"));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
