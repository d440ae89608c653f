//! Shared data types passed between the compiler, the backends and the
//! query dispatcher.

use serde::{Deserialize, Serialize};

/// Suffix distinguishing free fundamental concentrations from their totals.
pub const FREE_SUFFIX: &str = "_f";

/// Output name of the free concentration of a fundamental species.
pub fn free_name(species: &str) -> String {
    format!("{species}{FREE_SUFFIX}")
}

/// Ordered argument list of a binding backend: totals first, then
/// dissociation constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub totals: Vec<String>,
    pub kds: Vec<String>,
}

impl ParameterSchema {
    pub fn new(totals: Vec<String>, kds: Vec<String>) -> Self {
        Self { totals, kds }
    }

    pub fn len(&self) -> usize {
        self.totals.len() + self.kds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All argument names in call order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.totals.iter().chain(self.kds.iter()).map(String::as_str)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names().position(|n| n == name)
    }

    pub fn is_kd(&self, index: usize) -> bool {
        index >= self.totals.len() && index < self.len()
    }
}

/// Equilibrium concentrations keyed by species name, in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeciesMap {
    entries: Vec<(String, f64)>,
}

impl SpeciesMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Inserts or replaces a concentration.
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// Looks up a species by name, falling back to its free concentration
    /// when `species` is a fundamental species.
    pub fn concentration(&self, species: &str) -> Option<f64> {
        self.get(species).or_else(|| self.get(&free_name(species)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Which algebraic solution branches a multi-root system reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BranchPolicy {
    /// Only the non-negative root inside the conservation bounds.
    #[default]
    Physical,
    /// The physical root followed by the other real root, unfiltered.
    All,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn species_map_falls_back_to_free_name() {
        let mut map = SpeciesMap::new();
        map.insert("p_f", 0.25);
        map.insert("pl", 0.75);
        assert_eq!(map.concentration("p"), Some(0.25));
        assert_eq!(map.concentration("pl"), Some(0.75));
        assert_eq!(map.concentration("l"), None);
    }

    #[test]
    fn species_map_insert_replaces_and_keeps_order() {
        let mut map = SpeciesMap::new();
        map.insert("a", 1.0);
        map.insert("b", 2.0);
        map.insert("a", 3.0);
        let names: Vec<_> = map.names().collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(map.get("a"), Some(3.0));
    }

    #[test]
    fn schema_orders_totals_before_kds() {
        let schema = ParameterSchema::new(
            vec!["p".into(), "l".into()],
            vec!["kd_p_l_pl".into()],
        );
        let names: Vec<_> = schema.names().collect();
        assert_eq!(names, vec!["p", "l", "kd_p_l_pl"]);
        assert_eq!(schema.position("kd_p_l_pl"), Some(2));
        assert!(schema.is_kd(2));
        assert!(!schema.is_kd(1));
    }
}
