use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub dispatch: DispatchSettings,
}

/// Tunables of the matching engine.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub acceptance_window: Duration,
    pub location_staleness: Duration,
    pub initial_radius_km: f64,
    pub radius_growth_factor: f64,
    pub max_radius_km: f64,
    pub max_radius_widenings: u32,
    pub max_candidates: usize,
    pub max_matching_rounds: u32,
    pub reaper_interval: Duration,
    pub orphan_grace: Duration,
    pub scheduled_lead: Duration,
    pub ledger_retry_attempts: u32,
    pub ledger_backoff: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            acceptance_window: Duration::from_secs(15),
            location_staleness: Duration::from_secs(300),
            initial_radius_km: 10.0,
            radius_growth_factor: 2.0,
            max_radius_km: 40.0,
            max_radius_widenings: 1,
            max_candidates: 10,
            max_matching_rounds: 3,
            reaper_interval: Duration::from_millis(1000),
            orphan_grace: Duration::from_secs(30),
            scheduled_lead: Duration::from_secs(900),
            ledger_retry_attempts: 3,
            ledger_backoff: Duration::from_millis(100),
        }
    }
}

impl DispatchSettings {
    /// Search radius for the given round (1-based) after `widenings` in-round widenings.
    pub fn radius_km(&self, round: u32, widenings: u32) -> f64 {
        let steps = round.saturating_sub(1) + widenings;
        let radius = self.initial_radius_km * self.radius_growth_factor.powi(steps as i32);
        radius.min(self.max_radius_km.max(self.initial_radius_km))
    }

    pub fn acceptance_window_chrono(&self) -> chrono::Duration {
        to_chrono(self.acceptance_window)
    }

    pub fn staleness_chrono(&self) -> chrono::Duration {
        to_chrono(self.location_staleness)
    }

    pub fn orphan_grace_chrono(&self) -> chrono::Duration {
        to_chrono(self.orphan_grace)
    }

    pub fn scheduled_lead_chrono(&self) -> chrono::Duration {
        to_chrono(self.scheduled_lead)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.acceptance_window.is_zero() {
            return Err(AppError::Internal(
                "ACCEPTANCE_WINDOW_SECS must be > 0".to_string(),
            ));
        }
        if !(self.initial_radius_km > 0.0) {
            return Err(AppError::Internal("INITIAL_RADIUS_KM must be > 0".to_string()));
        }
        if !(self.radius_growth_factor >= 1.0) {
            return Err(AppError::Internal(
                "RADIUS_GROWTH_FACTOR must be >= 1".to_string(),
            ));
        }
        if self.max_candidates == 0 || self.max_matching_rounds == 0 {
            return Err(AppError::Internal(
                "MAX_CANDIDATES and MAX_MATCHING_ROUNDS must be > 0".to_string(),
            ));
        }
        if self.ledger_retry_attempts == 0 {
            return Err(AppError::Internal(
                "LEDGER_RETRY_ATTEMPTS must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let dispatch = DispatchSettings {
            acceptance_window: Duration::from_secs(parse_or_default("ACCEPTANCE_WINDOW_SECS", 15)?),
            location_staleness: Duration::from_secs(parse_or_default(
                "LOCATION_STALENESS_SECS",
                300,
            )?),
            initial_radius_km: parse_or_default("INITIAL_RADIUS_KM", 10.0)?,
            radius_growth_factor: parse_or_default("RADIUS_GROWTH_FACTOR", 2.0)?,
            max_radius_km: parse_or_default("MAX_RADIUS_KM", 40.0)?,
            max_radius_widenings: parse_or_default("MAX_RADIUS_WIDENINGS", 1)?,
            max_candidates: parse_or_default("MAX_CANDIDATES", 10)?,
            max_matching_rounds: parse_or_default("MAX_MATCHING_ROUNDS", 3)?,
            reaper_interval: Duration::from_millis(parse_or_default("REAPER_INTERVAL_MS", 1000)?),
            orphan_grace: Duration::from_secs(parse_or_default("ORPHAN_GRACE_SECS", 30)?),
            scheduled_lead: Duration::from_secs(parse_or_default("SCHEDULED_LEAD_SECS", 900)?),
            ledger_retry_attempts: parse_or_default("LEDGER_RETRY_ATTEMPTS", 3)?,
            ledger_backoff: Duration::from_millis(parse_or_default("LEDGER_BACKOFF_MS", 100)?),
        };
        dispatch.validate()?;

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            dispatch,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::DispatchSettings;

    #[test]
    fn radius_widens_per_round_and_caps() {
        let settings = DispatchSettings::default();
        assert_eq!(settings.radius_km(1, 0), 10.0);
        assert_eq!(settings.radius_km(1, 1), 20.0);
        assert_eq!(settings.radius_km(2, 0), 20.0);
        assert_eq!(settings.radius_km(3, 1), 40.0);
        assert_eq!(settings.radius_km(9, 9), 40.0);
    }

    #[test]
    fn defaults_validate() {
        assert!(DispatchSettings::default().validate().is_ok());
    }
}
