//! Reference-counted power domains with idle timeouts.
//!
//! Each domain has its own lock so ON/OFF transitions never serialize against
//! each other or against the lifecycle lock. Powering up happens synchronously
//! inside `acquire`; powering down is *only* done by the periodic idle scan,
//! so short stop/start cycles never thrash the hardware.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use isp_core::{CameraId, IspError, IspResult, IspTransport, PowerDomain};

struct PowerUnit {
    on: bool,
    refcount: u32,
    last_active: Instant,
}

impl PowerUnit {
    fn new() -> Self {
        PowerUnit {
            on: false,
            refcount: 0,
            last_active: Instant::now(),
        }
    }
}

/// All power units of one device, created once at device construction.
pub struct PowerManager {
    transport: Arc<dyn IspTransport>,
    units: HashMap<PowerDomain, Mutex<PowerUnit>>,
}

impl PowerManager {
    pub fn new(transport: Arc<dyn IspTransport>, sensors: &[CameraId]) -> Self {
        let mut units = HashMap::new();
        units.insert(PowerDomain::IspCore, Mutex::new(PowerUnit::new()));
        units.insert(PowerDomain::Phy, Mutex::new(PowerUnit::new()));
        for camera in sensors {
            units.insert(PowerDomain::Sensor(*camera), Mutex::new(PowerUnit::new()));
        }
        PowerManager { transport, units }
    }

    fn unit(&self, domain: PowerDomain) -> IspResult<&Mutex<PowerUnit>> {
        self.units
            .get(&domain)
            .ok_or_else(|| IspError::InvalidArgument(format!("no power unit for {domain}")))
    }

    /// Take a reference on `domain`, powering the hardware up on the 0→1
    /// transition. Fails without changing the reference count if the
    /// transport rejects the power-on.
    pub async fn acquire(&self, domain: PowerDomain) -> IspResult<()> {
        let mut unit = self.unit(domain)?.lock().await;
        if unit.refcount == 0 && !unit.on {
            self.transport.power_on(domain).await?;
            unit.on = true;
            debug!(%domain, "powered on");
        }
        unit.refcount += 1;
        unit.last_active = Instant::now();
        Ok(())
    }

    /// Drop a reference on `domain`. The hardware stays on; the idle scan
    /// powers it down once it has been unreferenced long enough.
    pub async fn release(&self, domain: PowerDomain) {
        let Ok(unit) = self.unit(domain) else {
            warn!(%domain, "release for unknown power unit");
            return;
        };
        let mut unit = unit.lock().await;
        if unit.refcount == 0 {
            warn!(%domain, "unbalanced power release");
            return;
        }
        unit.refcount -= 1;
        unit.last_active = Instant::now();
    }

    /// One best-effort power-saving sweep.
    ///
    /// Sensors idle past `sensor_idle` go down first; once every sensor is
    /// off, the PHY and the shared core go down after `core_idle`. A unit
    /// with a non-zero reference count is never touched.
    pub async fn idle_scan(&self, sensor_idle: Duration, core_idle: Duration) {
        let now = Instant::now();
        let mut any_sensor_on = false;
        for (domain, unit) in &self.units {
            if !matches!(domain, PowerDomain::Sensor(_)) {
                continue;
            }
            let mut unit = unit.lock().await;
            if unit.on
                && unit.refcount == 0
                && now.duration_since(unit.last_active) >= sensor_idle
            {
                self.power_down(*domain, &mut unit).await;
            }
            if unit.on {
                any_sensor_on = true;
            }
        }
        if any_sensor_on {
            return;
        }
        for domain in [PowerDomain::Phy, PowerDomain::IspCore] {
            let Ok(unit) = self.unit(domain) else { continue };
            let mut unit = unit.lock().await;
            if unit.on
                && unit.refcount == 0
                && now.duration_since(unit.last_active) >= core_idle
            {
                self.power_down(domain, &mut unit).await;
            }
        }
    }

    async fn power_down(&self, domain: PowerDomain, unit: &mut PowerUnit) {
        match self.transport.power_off(domain).await {
            Ok(()) => {
                unit.on = false;
                debug!(%domain, "powered off after idle timeout");
            }
            Err(err) => warn!(%domain, error = %err, "power-off failed; left on"),
        }
    }

    pub async fn is_on(&self, domain: PowerDomain) -> bool {
        match self.unit(domain) {
            Ok(unit) => unit.lock().await.on,
            Err(_) => false,
        }
    }

    pub async fn refcount(&self, domain: PowerDomain) -> u32 {
        match self.unit(domain) {
            Ok(unit) => unit.lock().await.refcount,
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use isp_transport_mock::MockTransport;

    const CAM0: CameraId = CameraId(0);

    fn manager(transport: &Arc<MockTransport>) -> PowerManager {
        PowerManager::new(transport.clone(), &[CAM0])
    }

    #[tokio::test]
    async fn nested_acquires_power_on_once() {
        let transport = MockTransport::new();
        let power = manager(&transport);

        power.acquire(PowerDomain::Sensor(CAM0)).await.unwrap();
        power.acquire(PowerDomain::Sensor(CAM0)).await.unwrap();
        assert_eq!(power.refcount(PowerDomain::Sensor(CAM0)).await, 2);
        assert_eq!(
            transport
                .power_log()
                .iter()
                .filter(|(_, on)| *on)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn unbalanced_release_never_goes_negative() {
        let transport = MockTransport::new();
        let power = manager(&transport);

        power.acquire(PowerDomain::IspCore).await.unwrap();
        power.release(PowerDomain::IspCore).await;
        power.release(PowerDomain::IspCore).await;
        assert_eq!(power.refcount(PowerDomain::IspCore).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_scan_powers_down_sensor_then_core() {
        let transport = MockTransport::new();
        let power = manager(&transport);
        let sensor_idle = Duration::from_millis(100);
        let core_idle = Duration::from_millis(200);

        power.acquire(PowerDomain::IspCore).await.unwrap();
        power.acquire(PowerDomain::Sensor(CAM0)).await.unwrap();
        power.release(PowerDomain::Sensor(CAM0)).await;
        power.release(PowerDomain::IspCore).await;

        // Not idle long enough yet.
        tokio::time::advance(Duration::from_millis(50)).await;
        power.idle_scan(sensor_idle, core_idle).await;
        assert!(power.is_on(PowerDomain::Sensor(CAM0)).await);
        assert!(power.is_on(PowerDomain::IspCore).await);

        // Sensor crosses its idle delay; the core has its own, longer one.
        tokio::time::advance(Duration::from_millis(100)).await;
        power.idle_scan(sensor_idle, core_idle).await;
        assert!(!power.is_on(PowerDomain::Sensor(CAM0)).await);
        assert!(power.is_on(PowerDomain::IspCore).await);

        tokio::time::advance(Duration::from_millis(100)).await;
        power.idle_scan(sensor_idle, core_idle).await;
        assert!(!power.is_on(PowerDomain::IspCore).await);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_scan_skips_referenced_units() {
        let transport = MockTransport::new();
        let power = manager(&transport);

        power.acquire(PowerDomain::Sensor(CAM0)).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        power
            .idle_scan(Duration::from_millis(1), Duration::from_millis(1))
            .await;
        assert!(power.is_on(PowerDomain::Sensor(CAM0)).await);
    }
}
