//! Scenario Model
//!
//! Immutable, validated description of a load-testing run. Scenario files are
//! YAML; JSON documents are accepted too since they parse as YAML.
//!
//! ```yaml
//! name: two-groups
//! type: denim
//! clients: 10
//! groups: [0.5, 0.5]
//! tickMillis: 100
//! durationTicks: 50
//! messageSizeRange: [10, 200]
//! denimProbability: 0.1
//! replyProbability: [0.5, 0.95]
//! sendRateRange: [1, 5]
//! replyRateRange: [1, 2]
//! staleReply: [1, 4]
//! ```

use crate::sam_error::ConfigError;
use crate::sam_graph::apportion;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Tolerance when checking that group fractions add up to 1
pub const GROUP_SUM_TOLERANCE: f64 = 1e-9;

/// Infrastructure the clients are emulating traffic against
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Infrastructure {
    Sam,
    #[serde(alias = "denim-on-sam")]
    Denim,
}

/// Group layout: either N equally sized groups, or explicit fractions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupSpec {
    Count(usize),
    Fractions(Vec<f64>),
}

/// A tick window given either as a fixed value or an inclusive range
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TickRange {
    Fixed(u64),
    Range(u64, u64),
}

impl TickRange {
    pub fn bounds(&self) -> (u64, u64) {
        match *self {
            TickRange::Fixed(v) => (v, v),
            TickRange::Range(min, max) => (min, max),
        }
    }
}

/// How a client's message sizes relate to its send rate
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SizeCoupling {
    /// sizes are drawn from the full range regardless of rate
    #[default]
    Independent,
    /// faster senders draw from a narrower range of smaller sizes
    InverseSendRate,
}

/// Validated scenario configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub name: String,

    /// Infrastructure endpoint the dispatcher talks to
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(rename = "type")]
    pub infrastructure: Infrastructure,

    pub clients: usize,

    pub groups: GroupSpec,

    /// Wall-clock length of one tick when pacing is enabled
    pub tick_millis: u64,

    pub duration_ticks: u64,

    pub message_size_range: (u32, u32),

    pub denim_probability: f64,

    /// Range a message's reply probability is drawn from on arrival
    pub reply_probability: (f64, f64),

    pub send_rate_range: (f64, f64),

    pub reply_rate_range: (f64, f64),

    /// Ticks after arrival during which a reply is still possible
    pub stale_reply: TickRange,

    /// Dirichlet concentration for intra-group friend weights
    #[serde(default = "default_friend_alpha")]
    pub friend_alpha: f64,

    /// Number of ticks a rate is expressed over (rate / rateUnitTicks = per-tick chance)
    #[serde(default = "default_rate_unit_ticks")]
    pub rate_unit_ticks: f64,

    #[serde(default)]
    pub size_coupling: SizeCoupling,

    /// Seconds to wait before tick 0 when pacing to wall-clock
    #[serde(default)]
    pub start_epoch: u64,

    /// Report file name; `<name>.json` when absent
    #[serde(default)]
    pub report: Option<String>,
}

fn default_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_friend_alpha() -> f64 {
    1.0
}

fn default_rate_unit_ticks() -> f64 {
    1.0
}

impl FromStr for Scenario {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let scenario: Scenario = serde_yaml::from_str(s)?;
        scenario.validate()?;
        Ok(scenario)
    }
}

impl Scenario {
    /// Read and validate a scenario file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        fs::read_to_string(path)?.parse()
    }

    /// Group fractions in order. An empty list means a single group.
    pub fn group_fractions(&self) -> Vec<f64> {
        match &self.groups {
            GroupSpec::Count(0) => vec![1.0],
            GroupSpec::Count(n) => vec![1.0 / *n as f64; *n],
            GroupSpec::Fractions(f) if f.is_empty() => vec![1.0],
            GroupSpec::Fractions(f) => f.clone(),
        }
    }

    /// File name the report is written to
    pub fn report_path(&self) -> String {
        self.report
            .clone()
            .unwrap_or_else(|| format!("{}.json", self.name))
    }

    /// Convert a rate (per `rate_unit_ticks`) to a per-tick probability, saturating at 1
    pub fn per_tick_probability(&self, rate: f64) -> f64 {
        (rate / self.rate_unit_ticks).clamp(0.0, 1.0)
    }

    /// Check every invariant of the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clients == 0 {
            return Err(ConfigError::NoClients);
        }
        // checked before the fractions get materialized
        if let GroupSpec::Count(groups) = self.groups {
            if groups > self.clients {
                return Err(ConfigError::TooFewClients {
                    clients: self.clients,
                    groups,
                });
            }
        }

        let fractions = self.group_fractions();
        for (index, &value) in fractions.iter().enumerate() {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ConfigError::GroupFraction { index, value });
            }
        }
        let sum: f64 = fractions.iter().sum();
        if (sum - 1.0).abs() > GROUP_SUM_TOLERANCE {
            return Err(ConfigError::GroupSum(sum));
        }
        if self.clients < fractions.len() {
            return Err(ConfigError::TooFewClients {
                clients: self.clients,
                groups: fractions.len(),
            });
        }

        check_range(
            "messageSizeRange",
            self.message_size_range.0 as f64,
            self.message_size_range.1 as f64,
        )?;
        check_range("sendRateRange", self.send_rate_range.0, self.send_rate_range.1)?;
        check_range("replyRateRange", self.reply_rate_range.0, self.reply_rate_range.1)?;
        check_range("replyProbability", self.reply_probability.0, self.reply_probability.1)?;
        let (stale_min, stale_max) = self.stale_reply.bounds();
        check_range("staleReply", stale_min as f64, stale_max as f64)?;

        check_probability("denimProbability", self.denim_probability)?;
        check_probability("replyProbability", self.reply_probability.0)?;
        check_probability("replyProbability", self.reply_probability.1)?;

        check_rate_range("sendRateRange", self.send_rate_range)?;
        check_rate_range("replyRateRange", self.reply_rate_range)?;

        check_positive("friendAlpha", self.friend_alpha)?;
        check_positive("rateUnitTicks", self.rate_unit_ticks)?;

        apportion(self.clients, &fractions)?;
        Ok(())
    }
}

fn check_range(field: &'static str, min: f64, max: f64) -> Result<(), ConfigError> {
    // written so that NaN bounds fail too
    if min <= max {
        Ok(())
    } else {
        Err(ConfigError::Range { field, min, max })
    }
}

/// Rates may be zero (a silent client), never negative or unbounded
fn check_rate_range(field: &'static str, (min, max): (f64, f64)) -> Result<(), ConfigError> {
    if !(min >= 0.0) {
        return Err(ConfigError::NotPositive { field, value: min });
    }
    if !max.is_finite() {
        return Err(ConfigError::NotPositive { field, value: max });
    }
    Ok(())
}

fn check_probability(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Probability { field, value })
    }
}

fn check_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Scenario used across the crate's tests: 4 clients in 2 groups,
    /// everybody sends every tick and replies as soon as possible.
    pub(crate) fn lockstep_scenario() -> Scenario {
        Scenario {
            name: "lockstep".to_string(),
            address: default_address(),
            infrastructure: Infrastructure::Sam,
            clients: 4,
            groups: GroupSpec::Fractions(vec![0.5, 0.5]),
            tick_millis: 100,
            duration_ticks: 3,
            message_size_range: (200, 200),
            denim_probability: 0.0,
            reply_probability: (1.0, 1.0),
            send_rate_range: (1.0, 1.0),
            reply_rate_range: (1.0, 1.0),
            stale_reply: TickRange::Fixed(1),
            friend_alpha: 1.0,
            rate_unit_ticks: 1.0,
            size_coupling: SizeCoupling::Independent,
            start_epoch: 0,
            report: None,
        }
    }

    const YAML: &str = r#"
name: test
type: denim-on-sam
clients: 10
groups: [0.5, 0.5]
tickMillis: 10
durationTicks: 10
messageSizeRange: [10, 20]
denimProbability: 0.1
sendRateRange: [1, 5]
replyRateRange: [1, 2]
replyProbability: [0.5, 0.95]
staleReply: 1
somethingElse: ignored
"#;

    #[test]
    fn test_parse_yaml() {
        let scenario: Scenario = YAML.parse().unwrap();

        assert_eq!(scenario.name, "test");
        assert_eq!(scenario.infrastructure, Infrastructure::Denim);
        assert_eq!(scenario.address, "127.0.0.1:8080");
        assert_eq!(scenario.group_fractions(), vec![0.5, 0.5]);
        assert_eq!(scenario.stale_reply, TickRange::Fixed(1));
        assert_eq!(scenario.send_rate_range, (1.0, 5.0));
        assert_eq!(scenario.friend_alpha, 1.0);
        assert_eq!(scenario.size_coupling, SizeCoupling::Independent);
        assert_eq!(scenario.report_path(), "test.json");
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "name": "json", "type": "sam", "clients": 6, "groups": 3,
            "tickMillis": 100, "durationTicks": 5, "messageSizeRange": [1, 2],
            "denimProbability": 0.0, "replyProbability": [0.1, 0.2],
            "sendRateRange": [1, 2], "replyRateRange": [1, 2],
            "staleReply": [2, 4], "friendAlpha": 0.5, "report": "out.json",
            "sizeCoupling": "inverseSendRate"
        }"#;
        let scenario: Scenario = json.parse().unwrap();

        assert_eq!(scenario.groups, GroupSpec::Count(3));
        assert_eq!(scenario.group_fractions().len(), 3);
        assert_eq!(scenario.stale_reply.bounds(), (2, 4));
        assert_eq!(scenario.size_coupling, SizeCoupling::InverseSendRate);
        assert_eq!(scenario.report_path(), "out.json");
    }

    #[test]
    fn test_missing_field_fails() {
        let yaml = YAML.replace("clients: 10\n", "");
        assert!(matches!(yaml.parse::<Scenario>(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_infrastructure_fails() {
        let yaml = YAML.replace("type: denim-on-sam", "type: carrier-pigeon");
        assert!(matches!(yaml.parse::<Scenario>(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_group_sum_mismatch() {
        let mut scenario = lockstep_scenario();
        scenario.groups = GroupSpec::Fractions(vec![0.5, 0.4]);
        assert!(matches!(scenario.validate(), Err(ConfigError::GroupSum(_))));

        scenario.groups = GroupSpec::Fractions(vec![1.5, -0.5]);
        assert!(matches!(
            scenario.validate(),
            Err(ConfigError::GroupFraction { index: 1, .. })
        ));
    }

    #[test]
    fn test_empty_groups_means_one_group() {
        let mut scenario = lockstep_scenario();
        scenario.groups = GroupSpec::Fractions(vec![]);
        assert_eq!(scenario.group_fractions(), vec![1.0]);
        assert!(scenario.validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        let mut scenario = lockstep_scenario();
        scenario.clients = 0;
        assert!(matches!(scenario.validate(), Err(ConfigError::NoClients)));

        let mut scenario = lockstep_scenario();
        scenario.groups = GroupSpec::Count(5);
        assert!(matches!(
            scenario.validate(),
            Err(ConfigError::TooFewClients { clients: 4, groups: 5 })
        ));

        let mut scenario = lockstep_scenario();
        scenario.message_size_range = (300, 200);
        assert!(matches!(
            scenario.validate(),
            Err(ConfigError::Range { field: "messageSizeRange", .. })
        ));

        let mut scenario = lockstep_scenario();
        scenario.stale_reply = TickRange::Range(3, 1);
        assert!(matches!(
            scenario.validate(),
            Err(ConfigError::Range { field: "staleReply", .. })
        ));

        let mut scenario = lockstep_scenario();
        scenario.denim_probability = 1.2;
        assert!(matches!(
            scenario.validate(),
            Err(ConfigError::Probability { field: "denimProbability", .. })
        ));

        let mut scenario = lockstep_scenario();
        scenario.friend_alpha = 0.0;
        assert!(matches!(
            scenario.validate(),
            Err(ConfigError::NotPositive { field: "friendAlpha", .. })
        ));

        let mut scenario = lockstep_scenario();
        scenario.send_rate_range = (-1.0, 1.0);
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn test_per_tick_probability_saturates() {
        let mut scenario = lockstep_scenario();
        scenario.rate_unit_ticks = 10.0;
        assert_eq!(scenario.per_tick_probability(5.0), 0.5);
        assert_eq!(scenario.per_tick_probability(50.0), 1.0);
        assert_eq!(scenario.per_tick_probability(0.0), 0.0);
    }

    #[test]
    fn test_shipped_scenarios_load() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios");

        let two = Scenario::load(dir.join("two_groups.yaml")).unwrap();
        assert_eq!(two.infrastructure, Infrastructure::Denim);
        assert_eq!(two.stale_reply, TickRange::Range(1, 4));

        let lockstep = Scenario::load(dir.join("lockstep.yaml")).unwrap();
        assert_eq!(lockstep.stale_reply, TickRange::Fixed(1));
        assert_eq!(lockstep.clients, 4);

        let crowd = Scenario::load(dir.join("crowd.json")).unwrap();
        assert_eq!(crowd.group_fractions().len(), 8);
        assert_eq!(crowd.size_coupling, SizeCoupling::InverseSendRate);
        assert_eq!(crowd.report_path(), "crowd-report.json");
    }

    #[test]
    fn test_group_count_larger_than_clients() {
        let yaml = YAML
            .replace("clients: 10", "clients: 4")
            .replace("groups: [0.5, 0.5]", "groups: 18446744073709551615");

        let result: Result<Scenario, _> = yaml.parse();
        assert!(matches!(
            result,
            Err(ConfigError::TooFewClients { clients: 4, groups: usize::MAX })
        ));
    }

    #[test]
    fn test_unbounded_rate_reports_upper_bound() {
        let mut scenario = lockstep_scenario();
        scenario.send_rate_range = (1.0, f64::INFINITY);
        let Err(ConfigError::NotPositive { field, value }) = scenario.validate() else {
            panic!("expected NotPositive");
        };
        assert_eq!(field, "sendRateRange");
        assert_eq!(value, f64::INFINITY);

        let mut scenario = lockstep_scenario();
        scenario.reply_rate_range = (-0.5, 2.0);
        assert!(matches!(
            scenario.validate(),
            Err(ConfigError::NotPositive { field: "replyRateRange", value }) if value == -0.5
        ));
    }
}
