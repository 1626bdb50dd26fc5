/// Helpers shared by the FDX and Modbus halves of the bridge
///
/// Transaction timing, register packing, range validation and formatting.
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};

/// Timing of serial transactions, one sample per attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceMetrics {
    pub attempts: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub busy_time: Duration,
    pub fastest: Option<Duration>,
    pub slowest: Option<Duration>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, elapsed: Duration, ok: bool) {
        self.attempts += 1;
        self.busy_time += elapsed;
        if ok {
            self.succeeded += 1;
            self.fastest = Some(self.fastest.map_or(elapsed, |d| d.min(elapsed)));
            self.slowest = Some(self.slowest.map_or(elapsed, |d| d.max(elapsed)));
        } else {
            self.failed += 1;
        }
    }

    /// Mean time per attempt
    pub fn average(&self) -> Duration {
        match u32::try_from(self.attempts) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.busy_time / n,
            Err(_) => Duration::from_secs_f64(self.busy_time.as_secs_f64() / self.attempts as f64),
        }
    }

    /// Percentage of attempts that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.succeeded as f64 * 100.0 / self.attempts as f64
        }
    }
}

/// Measures one transaction attempt
pub struct OperationTimer {
    started: Instant,
    label: String,
}

impl OperationTimer {
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            started: Instant::now(),
            label: label.into(),
        }
    }

    /// Elapsed time; failures are logged at warn level.
    pub fn finish(self, ok: bool) -> Duration {
        let elapsed = self.started.elapsed();
        if ok {
            debug!("{} took {:?}", self.label, elapsed);
        } else {
            warn!("{} failed after {:?}", self.label, elapsed);
        }
        elapsed
    }
}

/// Pack registers as big-endian words.
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    registers.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// Range checks for Modbus fields
pub mod validation {
    use super::*;

    /// Unicast slave addresses are 1..=247
    pub fn validate_slave_id(slave_id: u8) -> BridgeResult<()> {
        if !(1..=247).contains(&slave_id) {
            return Err(BridgeError::invalid_data(format!(
                "slave id {} outside 1-247",
                slave_id
            )));
        }
        Ok(())
    }

    /// Slave id carried in a 16-bit FDX field
    pub fn slave_id_from_u16(value: u16) -> BridgeResult<u8> {
        let slave_id = u8::try_from(value)
            .map_err(|_| BridgeError::invalid_data(format!("slave id {} outside 1-247", value)))?;
        validate_slave_id(slave_id)?;
        Ok(slave_id)
    }

    pub fn validate_address_range(start: u16, count: u16) -> BridgeResult<()> {
        if count == 0 || start.checked_add(count - 1).is_none() {
            return Err(BridgeError::invalid_address(start, count));
        }
        Ok(())
    }

    pub fn validate_register_count(count: u16, max: u16) -> BridgeResult<()> {
        if count == 0 || count > max {
            return Err(BridgeError::invalid_data(format!(
                "register count {} outside 1-{}",
                count, max
            )));
        }
        Ok(())
    }
}

pub mod format {
    use super::*;

    pub fn format_duration(duration: Duration) -> String {
        if duration < Duration::from_millis(1) {
            format!("{}us", duration.as_micros())
        } else if duration < Duration::from_secs(1) {
            format!("{:.1}ms", duration.as_secs_f64() * 1000.0)
        } else {
            format!("{:.2}s", duration.as_secs_f64())
        }
    }

    /// One-line summary for the shutdown log
    pub fn format_metrics(metrics: &PerformanceMetrics) -> String {
        let bound = |d: Option<Duration>| d.map_or_else(|| "-".to_string(), format_duration);
        format!(
            "serial: {} attempts, {} ok ({:.1}%), {} failed, avg {}, min {}, max {}",
            metrics.attempts,
            metrics.succeeded,
            metrics.success_rate(),
            metrics.failed,
            format_duration(metrics.average()),
            bound(metrics.fastest),
            bound(metrics.slowest),
        )
    }
}

/// Install a debug-level `tracing` subscriber that writes through the test harness.
pub fn init_test_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_record() {
        let mut metrics = PerformanceMetrics::new();
        metrics.record(Duration::from_millis(4), true);
        metrics.record(Duration::from_millis(8), true);
        metrics.record(Duration::from_millis(30), false);

        assert_eq!(metrics.attempts, 3);
        assert_eq!(metrics.succeeded, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.average(), Duration::from_millis(14));
        // failed attempts do not move the bounds
        assert_eq!(metrics.slowest, Some(Duration::from_millis(8)));
        assert_eq!(metrics.fastest, Some(Duration::from_millis(4)));
        assert!((metrics.success_rate() - 66.7).abs() < 0.1);
        assert_eq!(PerformanceMetrics::new().average(), Duration::ZERO);
    }

    #[test]
    fn test_validation() {
        assert!(validation::validate_slave_id(247).is_ok());
        assert!(validation::validate_slave_id(0).is_err());
        assert!(validation::validate_slave_id(248).is_err());

        assert_eq!(validation::slave_id_from_u16(17).unwrap(), 17);
        assert!(validation::slave_id_from_u16(0x0101).is_err());

        assert!(validation::validate_address_range(0xFFFF, 1).is_ok());
        assert!(validation::validate_address_range(0xFFFF, 2).is_err());
        assert!(validation::validate_address_range(10, 0).is_err());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(registers_to_bytes(&[0x1234, 0x0001]), vec![0x12, 0x34, 0x00, 0x01]);
        assert_eq!(format::format_duration(Duration::from_micros(250)), "250us");
        assert_eq!(format::format_duration(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(format::format_duration(Duration::from_millis(2500)), "2.50s");
    }
}
