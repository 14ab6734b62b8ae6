//! Cluster → screen → verb permission table.
//!
//! The table is built once from configuration and handed to the engine; it is
//! never mutated by application logic.

use crate::config::AuthorizationConfig;
use crate::errors::ServiceError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// Workflow screens gated by the table
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Screen {
    Blueprints,
    CellLots,
    Modules,
    Packs,
    Eol,
    Quarantine,
    Lineage,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Verb {
    View,
    Create,
    Edit,
    Execute,
    Approve,
    Manage,
}

impl Verb {
    /// Single-letter code used in configuration (`V`, `C`, `E`, `X`, `A`, `M`)
    pub fn letter(self) -> char {
        match self {
            Verb::View => 'V',
            Verb::Create => 'C',
            Verb::Edit => 'E',
            Verb::Execute => 'X',
            Verb::Approve => 'A',
            Verb::Manage => 'M',
        }
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'V' => Some(Verb::View),
            'C' => Some(Verb::Create),
            'E' => Some(Verb::Edit),
            'X' => Some(Verb::Execute),
            'A' => Some(Verb::Approve),
            'M' => Some(Verb::Manage),
            _ => None,
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Compact set of verbs granted on one screen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct VerbSet(u8);

impl VerbSet {
    pub const fn empty() -> Self {
        VerbSet(0)
    }

    pub fn all() -> Self {
        Verb::iter().fold(Self::empty(), Self::with)
    }

    pub fn with(self, verb: Verb) -> Self {
        VerbSet(self.0 | verb.bit())
    }

    pub fn contains(self, verb: Verb) -> bool {
        self.0 & verb.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Verb> {
        Verb::iter().filter(move |v| self.contains(*v))
    }
}

impl FromStr for VerbSet {
    type Err = ServiceError;

    fn from_str(letters: &str) -> Result<Self, Self::Err> {
        letters
            .chars()
            .filter(|c| !c.is_whitespace())
            .try_fold(VerbSet::empty(), |set, c| {
                Verb::from_letter(c)
                    .map(|v| set.with(v))
                    .ok_or_else(|| ServiceError::InvalidInput(format!("unknown verb letter '{}'", c)))
            })
    }
}

impl fmt::Display for VerbSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for verb in self.iter() {
            write!(f, "{}", verb.letter())?;
        }
        Ok(())
    }
}

/// Named group of roles sharing one permission set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self {
        ClusterId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PermissionTable {
    super_cluster: Option<ClusterId>,
    role_clusters: HashMap<String, ClusterId>,
    grants: HashMap<ClusterId, HashMap<Screen, VerbSet>>,
}

impl PermissionTable {
    /// Empty table: every lookup denies, no super cluster.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_super_cluster(mut self, cluster: ClusterId) -> Self {
        self.super_cluster = Some(cluster);
        self
    }

    pub fn with_role(mut self, role: impl Into<String>, cluster: ClusterId) -> Self {
        self.role_clusters.insert(role.into(), cluster);
        self
    }

    pub fn grant(mut self, cluster: ClusterId, screen: Screen, verbs: VerbSet) -> Self {
        self.grants.entry(cluster).or_default().insert(screen, verbs);
        self
    }

    pub fn from_config(config: &AuthorizationConfig) -> Result<Self, ServiceError> {
        let mut table = PermissionTable::new();

        if let Some(super_cluster) = config
            .super_cluster
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            table = table.with_super_cluster(ClusterId::new(super_cluster));
        }

        for (role, cluster) in &config.roles {
            table = table.with_role(role.clone(), ClusterId::new(cluster.clone()));
        }

        for (cluster, screens) in &config.clusters {
            for (screen, letters) in screens {
                let screen = Screen::from_str(screen).map_err(|_| {
                    ServiceError::InvalidInput(format!(
                        "cluster '{}' references unknown screen '{}'",
                        cluster, screen
                    ))
                })?;
                let verbs = letters.parse::<VerbSet>()?;
                table = table.grant(ClusterId::new(cluster.clone()), screen, verbs);
            }
        }

        Ok(table)
    }

    pub fn is_super(&self, cluster: &ClusterId) -> bool {
        self.super_cluster.as_ref() == Some(cluster)
    }

    pub fn super_cluster(&self) -> Option<&ClusterId> {
        self.super_cluster.as_ref()
    }

    pub fn cluster_for_role(&self, role: &str) -> Option<&ClusterId> {
        self.role_clusters.get(role)
    }

    /// Verbs explicitly granted; the super bypass is not reflected here.
    pub fn verbs(&self, cluster: &ClusterId, screen: Screen) -> VerbSet {
        self.grants
            .get(cluster)
            .and_then(|screens| screens.get(&screen))
            .copied()
            .unwrap_or_default()
    }

    pub fn can_view(&self, cluster: &ClusterId, screen: Screen) -> bool {
        self.can_do(cluster, screen, Verb::View)
    }

    pub fn can_do(&self, cluster: &ClusterId, screen: Screen, verb: Verb) -> bool {
        self.is_super(cluster) || self.verbs(cluster, screen).contains(verb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn operator() -> ClusterId {
        ClusterId::new("line_ops")
    }

    #[test]
    fn parses_verb_letters() {
        let set: VerbSet = "VCX".parse().unwrap();
        assert!(set.contains(Verb::View));
        assert!(set.contains(Verb::Create));
        assert!(set.contains(Verb::Execute));
        assert!(!set.contains(Verb::Approve));
        assert_eq!(set.to_string(), "VCX");
        assert!("VQ".parse::<VerbSet>().is_err());
    }

    #[test]
    fn missing_entry_denies() {
        let table = PermissionTable::new().grant(operator(), Screen::Modules, "VX".parse().unwrap());
        assert!(table.can_do(&operator(), Screen::Modules, Verb::Execute));
        assert!(!table.can_do(&operator(), Screen::Modules, Verb::Manage));
        assert!(!table.can_view(&operator(), Screen::Packs));
        assert!(!table.can_view(&ClusterId::new("unknown"), Screen::Modules));
    }

    #[test]
    fn super_cluster_is_explicit() {
        let table = PermissionTable::new().with_super_cluster(ClusterId::new("plant_admin"));
        assert!(table.can_do(&ClusterId::new("plant_admin"), Screen::Eol, Verb::Approve));
        assert!(!table.can_do(&ClusterId::new("admin"), Screen::Eol, Verb::Approve));
        assert!(table
            .verbs(&ClusterId::new("plant_admin"), Screen::Eol)
            .is_empty());
    }

    #[test]
    fn builds_from_config() {
        let config = AuthorizationConfig::default();
        let table = PermissionTable::from_config(&config).unwrap();
        let cluster = table.cluster_for_role("quality_engineer").cloned().unwrap();
        assert!(table.can_do(&cluster, Screen::Eol, Verb::Approve));
        assert!(table.super_cluster().is_some());
    }

    #[test]
    fn rejects_unknown_screen_in_config() {
        let mut config = AuthorizationConfig::default();
        config
            .clusters
            .entry("line_ops".into())
            .or_default()
            .insert("warehouse".into(), "V".into());
        assert!(PermissionTable::from_config(&config).is_err());
    }

    fn any_screen() -> impl Strategy<Value = Screen> {
        prop::sample::select(Screen::iter().collect::<Vec<_>>())
    }

    fn any_verb() -> impl Strategy<Value = Verb> {
        prop::sample::select(Verb::iter().collect::<Vec<_>>())
    }

    proptest! {
        #[test]
        fn empty_table_always_denies(screen in any_screen(), verb in any_verb(), name in "[a-z_]{1,12}") {
            let table = PermissionTable::new();
            prop_assert!(!table.can_do(&ClusterId::new(name), screen, verb));
        }

        #[test]
        fn super_cluster_always_allows(screen in any_screen(), verb in any_verb(), mask in 0u8..64) {
            let restricted = Verb::iter()
                .filter(|v| mask & v.bit() != 0)
                .fold(VerbSet::empty(), VerbSet::with);
            let root = ClusterId::new("root");
            let table = PermissionTable::new()
                .with_super_cluster(root.clone())
                .grant(root.clone(), screen, restricted);
            prop_assert!(table.can_do(&root, screen, verb));
        }
    }
}
