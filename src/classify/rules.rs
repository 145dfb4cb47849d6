// src/classify/rules.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::Slot;

const ENV_PATH: &str = "SLOT_RULES_PATH";
const DEFAULT_PATH: &str = "config/slots.toml";

/// Editorial definition of one slot.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SlotRule {
    pub slot: Slot,
    pub name: String,
    /// Candidates older than this are never eligible.
    pub max_age_hours: i64,
    /// What the slot is about, as handed to the judge.
    pub topic: String,
    /// Headlines naming a flagship company are always eligible here.
    #[serde(default)]
    pub flagship: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotRules {
    rules: Vec<SlotRule>,
}

#[derive(Deserialize)]
struct RulesFile {
    #[serde(rename = "slot")]
    slots: Vec<SlotRule>,
}

impl SlotRules {
    /// Exactly one rule per slot 1..=5.
    pub fn new(mut rules: Vec<SlotRule>) -> Result<Self> {
        rules.sort_by_key(|r| r.slot);
        let slots: Vec<u8> = rules.iter().map(|r| r.slot.number()).collect();
        let expected: Vec<u8> = Slot::all().map(Slot::number).collect();
        if slots != expected {
            bail!("slot rules must define each slot 1..=5 exactly once, got {slots:?}");
        }
        if let Some(r) = rules.iter().find(|r| r.max_age_hours <= 0) {
            bail!("slot {} has a non-positive max_age_hours", r.slot);
        }
        Ok(Self { rules })
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading slot rules from {}", path.display()))?;
        let file: RulesFile = toml::from_str(&content)
            .with_context(|| format!("parsing slot rules in {}", path.display()))?;
        Self::new(file.slots)
    }

    /// Load rules using explicit path + fallbacks:
    /// 1) `explicit` (from config)
    /// 2) $SLOT_RULES_PATH
    /// 3) config/slots.toml
    /// 4) built-in seed
    pub fn load_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        let default = PathBuf::from(DEFAULT_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        Ok(Self::default_seed())
    }

    pub fn rule(&self, slot: Slot) -> &SlotRule {
        // `new` guarantees one rule per slot in slot order.
        &self.rules[usize::from(slot.number() - 1)]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlotRule> {
        self.rules.iter()
    }

    pub fn default_seed() -> Self {
        let seed = [
            (1, "Lead", 24, "The single most consequential technology or business story of the last day.", false),
            (2, "Flagship", 48, "News about one of the largest technology companies (products, earnings, leadership, regulation).", true),
            (3, "Builders", 168, "Startups, emerging companies, funding rounds and new products from smaller players.", false),
            (4, "Policy & Markets", 48, "Regulation, government policy, macro-economics or market moves that affect the industry.", false),
            (5, "Wildcard", 168, "Science, research, culture or an unusual story readers would not expect.", false),
        ];
        let rules = seed
            .into_iter()
            .filter_map(|(n, name, hours, topic, flagship)| {
                Some(SlotRule {
                    slot: Slot::new(n).ok()?,
                    name: name.to_string(),
                    max_age_hours: hours,
                    topic: topic.to_string(),
                    flagship,
                })
            })
            .collect();
        Self { rules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn seed_has_expected_freshness_windows() {
        let r = SlotRules::default_seed();
        let hours: Vec<i64> = r.iter().map(|r| r.max_age_hours).collect();
        assert_eq!(hours, vec![24, 48, 168, 48, 168]);
        assert!(r.rule(Slot::new(2).unwrap()).flagship);
        assert!(SlotRules::new(r.rules.clone()).is_ok());
    }

    #[test]
    fn incomplete_rule_sets_are_rejected() {
        let mut rules = SlotRules::default_seed().rules;
        rules.pop();
        assert!(SlotRules::new(rules).is_err());
    }

    #[test]
    fn parses_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("slots.toml");
        let mut body = String::new();
        for n in 1..=5 {
            body.push_str(&format!(
                "[[slot]]\nslot = {n}\nname = \"S{n}\"\nmax_age_hours = {}\ntopic = \"t{n}\"\nflagship = {}\n\n",
                n * 10,
                n == 2
            ));
        }
        fs::write(&p, body).unwrap();
        let r = SlotRules::load_from(&p).unwrap();
        assert_eq!(r.rule(Slot::new(3).unwrap()).max_age_hours, 30);
        assert_eq!(r.rule(Slot::new(5).unwrap()).name, "S5");
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_seed() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_PATH);

        assert_eq!(SlotRules::load_default(None).unwrap(), SlotRules::default_seed());

        env::set_var(ENV_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(SlotRules::load_default(None).is_err());
        env::remove_var(ENV_PATH);

        env::set_current_dir(&old).unwrap();
    }
}
