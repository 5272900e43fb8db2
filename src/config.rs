use crate::model::{ExternalEvent, Membership};
use crate::units::Location;
use crate::weather::Providers;
use anyhow::Context;
use chrono_tz::Tz;
use const_format::concatcp;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use log::{debug, info};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_CONFIG: &str = concatcp!("/etc/", NAME, "/", NAME, ".toml");
pub const DEFAULT_USER_AGENT: &str = concatcp!(NAME, "/", VERSION);

/// A tee-sheet site: where it is, which CRM family speaks for it, and
/// the endpoints the adapter needs.
#[derive(Deserialize, Debug, Clone)]
pub struct ClubConfig {
    pub name: String,
    /// CRM family id selecting the adapter: `fairway`, `greenfee` or
    /// `teepass`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub location: Location,
    #[serde(default)]
    pub address: Option<String>,
    pub base_url: String,
    /// Second base for split-player CRMs' full-day flight endpoint.
    #[serde(default)]
    pub rest_base_url: Option<String>,
    /// Tee-sheet resource the club's bookings live under, for CRMs that
    /// key flights on it.
    #[serde(default)]
    pub product_id: Option<String>,
    pub local_tz: Tz,
    /// Which course name to show when the wire record carries none.
    #[serde(default)]
    pub course_name: Option<String>,
}

impl ClubConfig {
    pub fn course_name(&self) -> &str {
        self.course_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct UserConfig {
    #[serde(default, rename = "membership")]
    pub memberships: Vec<Membership>,
    #[serde(default, rename = "event")]
    pub external_events: Vec<ExternalEvent>,
    /// Target path of the user's generated calendar.
    pub calendar_path: PathBuf,
    /// Reminder offset in minutes relative to event start; negative
    /// means before.
    #[serde(default = "default_reminder_minutes")]
    pub reminder_minutes: i64,
}

const fn default_reminder_minutes() -> i64 {
    -60
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOuts {
    #[serde(default = "default_fan_out")]
    pub memberships: usize,
    #[serde(default = "default_fan_out")]
    pub weather: usize,
}

const fn default_fan_out() -> usize {
    4
}

impl Default for FanOuts {
    fn default() -> Self {
        Self {
            memberships: default_fan_out(),
            weather: default_fan_out(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default, rename = "user")]
    pub users: BTreeMap<String, UserConfig>,
    #[serde(default, rename = "club")]
    pub clubs: BTreeMap<String, ClubConfig>,
    #[serde(default, rename = "provider")]
    pub providers: Providers,
    #[serde(default = "default_timezone")]
    pub timezone_default: Tz,
    /// Events closer together than this are advised as conflicts.
    #[serde(default = "default_buffer_minutes")]
    pub buffer_minutes: i64,
    #[serde(default)]
    pub fan_outs: FanOuts,
    #[serde(default = "default_cache_db")]
    pub cache_db: PathBuf,
    /// How far ahead reservations are pulled.
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
    /// Wall-clock budget for one user pipeline run.
    #[serde(default = "default_run_timeout", with = "humantime_serde")]
    pub run_timeout: Duration,
}

fn default_timezone() -> Tz {
    chrono_tz::UTC
}

const fn default_buffer_minutes() -> i64 {
    60
}

fn default_cache_db() -> PathBuf {
    PathBuf::from(concatcp!("/var/cache/", NAME, "/weather.db"))
}

const fn default_horizon_days() -> u32 {
    180
}

const fn default_run_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            users: BTreeMap::new(),
            clubs: BTreeMap::new(),
            providers: Providers::default(),
            timezone_default: default_timezone(),
            buffer_minutes: default_buffer_minutes(),
            fan_outs: FanOuts::default(),
            cache_db: default_cache_db(),
            horizon_days: default_horizon_days(),
            run_timeout: default_run_timeout(),
        }
    }
}

pub fn read(config_file: PathBuf) -> anyhow::Result<Config> {
    info!("Reading config file {config_file:?}");

    let config = extract(Figment::new().merge(Toml::file(config_file)))?;

    debug!("Read config is {config:?}");

    Ok(config)
}

fn extract(figment: Figment) -> anyhow::Result<Config> {
    let config: Config = figment
        .merge(Env::prefixed("FWCAL_").split("__"))
        .extract()
        .context("Invalid configuration")?;

    config.validate()?;

    Ok(config)
}

impl Config {
    /// Referential checks that serde cannot express: memberships must
    /// point at configured clubs.
    fn validate(&self) -> anyhow::Result<()> {
        for (user, user_config) in &self.users {
            for membership in &user_config.memberships {
                if !self.clubs.contains_key(&membership.club_id) {
                    anyhow::bail!(
                        "User {user:?} has a membership for unknown club {:?}",
                        membership.club_id
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{extract, DEFAULT_USER_AGENT};
    use figment::providers::{Format, Toml};
    use figment::Figment;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
        [club.oslo-golf]
        name = "Oslo Golfklubb"
        type = "fairway"
        lat = 59.8940
        lon = 10.8282
        base_url = "https://teesheet.oslogk.example/api"
        rest_base_url = "https://rest.oslogk.example/api"
        product_id = "77"
        local_tz = "Europe/Oslo"

        [user.heikki]
        calendar_path = "/var/lib/fairwaycal/heikki.ics"

        [[user.heikki.membership]]
        club_id = "oslo-golf"
        user_id = "12345"
        local_tz = "Europe/Oslo"
        credentials = { auth_kind = "bearer-token", secrets = { token = "abc" } }

        [provider.nordic]
        user_agent = "fairwaycal-test/1.0"

        [provider.global]
    "#;

    #[test]
    fn minimal_config_extracts() {
        let config = extract(Figment::new().merge(Toml::string(MINIMAL))).unwrap();

        assert_eq!(1, config.users.len());
        assert_eq!(1, config.clubs.len());
        assert_eq!(60, config.buffer_minutes);
        assert_eq!(4, config.fan_outs.memberships);
        assert_eq!(180, config.horizon_days);

        let club = &config.clubs["oslo-golf"];
        assert_eq!("fairway", club.kind);
        assert_eq!("Oslo Golfklubb", club.course_name());

        let user = &config.users["heikki"];
        assert_eq!(-60, user.reminder_minutes);
        assert_eq!(1, user.memberships.len());

        let providers: Vec<_> = config.providers.into_iter().collect();
        assert_eq!(2, providers.len());
        assert_eq!("nordic", providers[0].id());
        assert_eq!("global", providers[1].id());
    }

    #[test]
    fn membership_for_unknown_club_is_rejected() {
        let broken = r#"
            [user.heikki]
            calendar_path = "/tmp/h.ics"

            [[user.heikki.membership]]
            club_id = "nowhere"
            user_id = "1"
            local_tz = "Europe/Oslo"
            credentials = { auth_kind = "cookie-session", secrets = {} }
        "#;

        assert!(extract(Figment::new().merge(Toml::string(broken))).is_err());
    }

    #[test]
    fn disabled_provider_is_not_registered() {
        let toml = r#"
            [provider.nordic]
            enabled = false

            [provider.global]
        "#;

        let config = extract(Figment::new().merge(Toml::string(toml))).unwrap();
        let providers: Vec<_> = config.providers.into_iter().collect();

        assert_eq!(1, providers.len());
        assert_eq!("global", providers[0].id());
    }

    #[test]
    fn default_user_agent_carries_the_crate_name() {
        assert!(DEFAULT_USER_AGENT.starts_with("fairwaycal/"));
    }

    #[test]
    fn external_events_parse_with_priorities() {
        let with_event = r#"
            [user.heikki]
            calendar_path = "/tmp/h.ics"

            [[user.heikki.event]]
            id = "ext-1"
            summary = "Dentist"
            category = "appointment"
            priority = "high"
            local_tz = "Europe/Helsinki"
            time = { start_utc = "2026-08-10T08:00:00Z", end_utc = "2026-08-10T09:00:00Z" }
        "#;

        let config = extract(Figment::new().merge(Toml::string(with_event))).unwrap();
        let events = &config.users["heikki"].external_events;

        assert_eq!(1, events.len());
        assert_eq!("Dentist", events[0].summary);
        assert_eq!(crate::model::EventPriority::High, events[0].priority);
    }
}
