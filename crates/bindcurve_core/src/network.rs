//! Parser for the reaction-network DSL.
//!
//! A network is a list of reactions `r1+r2<->product`, separated by newlines
//! and/or commas. Input is case-folded and whitespace-insensitive, `#` starts
//! a comment that runs to the end of the line, and a single species may be
//! marked with `*` as the readout.

use std::fmt;
use thiserror::Error;
use tracing::warn;

const ARROW: &str = "<->";
const READOUT_MARKER: char = '*';

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NetworkError {
    #[error("network definition contains no reactions")]
    Empty,

    #[error("malformed reaction '{line}': {reason}")]
    MalformedReaction { line: String, reason: String },

    #[error("more than one readout species marked: {}", .0.join(", "))]
    MultipleReadouts(Vec<String>),

    #[error("network has no fundamental species (every species is a product)")]
    NoFundamentalSpecies,

    #[error("network has no derived species")]
    NoDerivedSpecies,

    #[error("reaction '{reaction}' does not add exactly one numbered site ({found} found)")]
    AmbiguousSiteTag { reaction: String, found: usize },

    #[error("species '{species}' is defined in terms of itself")]
    Cycle { species: String },

    #[error("parallel routes to '{product}' disagree on its composition")]
    InconsistentStoichiometry { product: String },
}

/// A single elementary binding reaction `r1 + r2 <-> product`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reaction {
    pub reactants: [String; 2],
    pub product: String,
}

impl Reaction {
    pub fn new(r1: impl Into<String>, r2: impl Into<String>, product: impl Into<String>) -> Self {
        Self {
            reactants: [r1.into(), r2.into()],
            product: product.into(),
        }
    }

    /// Name of the dissociation constant, e.g. `kd_p_l_pl`.
    pub fn kd_name(&self) -> String {
        format!(
            "kd_{}_{}_{}",
            self.reactants[0], self.reactants[1], self.product
        )
    }

    pub fn involves_digits(&self) -> bool {
        self.participants()
            .any(|s| s.chars().any(|c| c.is_ascii_digit()))
    }

    pub fn participants(&self) -> impl Iterator<Item = &str> {
        [&self.reactants[0], &self.reactants[1], &self.product]
            .into_iter()
            .map(String::as_str)
    }
}

impl fmt::Display for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}+{}{ARROW}{}",
            self.reactants[0], self.reactants[1], self.product
        )
    }
}

/// A parsed reaction network.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionNetwork {
    reactions: Vec<Reaction>,
    species: Vec<String>,
    fundamental: Vec<String>,
    derived: Vec<String>,
    readout: String,
    readout_defaulted: bool,
}

impl ReactionNetwork {
    /// Parses a network definition string.
    pub fn parse(definition: &str) -> Result<Self, NetworkError> {
        let mut reactions: Vec<Reaction> = Vec::new();
        let mut marked: Vec<String> = Vec::new();

        for segment in segments(definition) {
            let (reaction, readout) = parse_reaction(&segment)?;
            if let Some(species) = readout {
                if !marked.contains(&species) {
                    marked.push(species);
                }
            }
            if reactions.contains(&reaction) {
                warn!(reaction = %reaction, "Duplicate reaction ignored.");
                continue;
            }
            reactions.push(reaction);
        }

        Self::from_reactions(reactions, marked)
    }

    fn from_reactions(reactions: Vec<Reaction>, marked: Vec<String>) -> Result<Self, NetworkError> {
        if reactions.is_empty() {
            return Err(NetworkError::Empty);
        }
        if marked.len() > 1 {
            return Err(NetworkError::MultipleReadouts(marked));
        }

        let mut species: Vec<String> = Vec::new();
        for name in reactions.iter().flat_map(Reaction::participants) {
            if !species.iter().any(|s| s == name) {
                species.push(name.to_string());
            }
        }

        let is_product = |name: &str| reactions.iter().any(|r| r.product == name);
        let (derived, fundamental): (Vec<String>, Vec<String>) =
            species.iter().cloned().partition(|s| is_product(s.as_str()));

        if fundamental.is_empty() {
            return Err(NetworkError::NoFundamentalSpecies);
        }
        if derived.is_empty() {
            return Err(NetworkError::NoDerivedSpecies);
        }

        let (readout, readout_defaulted) = match marked.into_iter().next() {
            Some(species) => (species, false),
            None => {
                let first = reactions[0].product.clone();
                warn!(
                    readout = %first,
                    "No readout species marked with '*'; using the first product."
                );
                (first, true)
            }
        };

        Ok(Self {
            reactions,
            species,
            fundamental,
            derived,
            readout,
            readout_defaulted,
        })
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    /// All species in first-appearance order.
    pub fn species(&self) -> &[String] {
        &self.species
    }

    pub fn fundamental(&self) -> &[String] {
        &self.fundamental
    }

    pub fn derived(&self) -> &[String] {
        &self.derived
    }

    pub fn readout(&self) -> &str {
        &self.readout
    }

    /// True when no species was marked and the first product was chosen.
    pub fn readout_defaulted(&self) -> bool {
        self.readout_defaulted
    }

    pub fn is_fundamental(&self, species: &str) -> bool {
        self.fundamental.iter().any(|s| s == species)
    }

    pub fn contains(&self, species: &str) -> bool {
        self.species.iter().any(|s| s == species)
    }

    /// Reactions producing `product`, in definition order.
    pub fn routes<'a>(&'a self, product: &'a str) -> impl Iterator<Item = &'a Reaction> + 'a {
        self.reactions.iter().filter(move |r| r.product == product)
    }

    /// Dissociation constant names in first-encountered order.
    pub fn kd_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.reactions.len());
        for name in self.reactions.iter().map(Reaction::kd_name) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

/// Splits a definition into trimmed, lowercased, comment-free reaction strings.
fn segments(definition: &str) -> Vec<String> {
    definition
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(|line| line.split(','))
        .map(|s| {
            s.chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_reaction(text: &str) -> Result<(Reaction, Option<String>), NetworkError> {
    let malformed = |reason: &str| NetworkError::MalformedReaction {
        line: text.to_string(),
        reason: reason.to_string(),
    };

    let (lhs, product) = text
        .split_once(ARROW)
        .ok_or_else(|| malformed("expected '<->'"))?;
    if product.contains(ARROW) {
        return Err(malformed("more than one '<->'"));
    }
    let mut reactants = lhs.split('+');
    let (r1, r2) = match (reactants.next(), reactants.next(), reactants.next()) {
        (Some(a), Some(b), None) => (a, b),
        _ => return Err(malformed("expected exactly two reactants joined by '+'")),
    };

    let mut readout: Option<String> = None;
    let mut names: Vec<String> = Vec::with_capacity(3);
    for token in [r1, r2, product] {
        let name: String = token.chars().filter(|&c| c != READOUT_MARKER).collect();
        validate_species_name(&name).map_err(|reason| malformed(&reason))?;
        if name.len() != token.len() {
            match &readout {
                Some(existing) if existing != &name => {
                    return Err(NetworkError::MultipleReadouts(vec![existing.clone(), name]));
                }
                _ => readout = Some(name.clone()),
            }
        }
        names.push(name);
    }

    let product = names.pop().unwrap_or_default();
    let r2 = names.pop().unwrap_or_default();
    let r1 = names.pop().unwrap_or_default();
    Ok((Reaction::new(r1, r2, product), readout))
}

fn validate_species_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    match chars.next() {
        None => Err("empty species name".to_string()),
        Some(c) if !c.is_ascii_alphabetic() => {
            Err(format!("species '{name}' must start with a letter"))
        }
        _ if !chars.all(|c| c.is_ascii_alphanumeric()) => Err(format!(
            "species '{name}' may only contain ASCII letters and digits"
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, NetworkError>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn parses_species_in_first_appearance_order() {
        let net = ReactionNetwork::parse("P + C <-> PC\nP+U<->PU, PC+U<->PCU\nPU+C<->PCU*")
            .expect("network should parse");
        assert_eq!(net.species(), &["p", "c", "pc", "u", "pu", "pcu"]);
        assert_eq!(net.fundamental(), &["p", "c", "u"]);
        assert_eq!(net.derived(), &["pc", "pu", "pcu"]);
        assert_eq!(net.readout(), "pcu");
        assert!(!net.readout_defaulted());
        assert_eq!(net.routes("pcu").count(), 2);
    }

    #[test]
    fn kd_names_follow_reactions() {
        let net = ReactionNetwork::parse("p+l<->pl*, p+i<->pi").expect("parse");
        assert_eq!(net.kd_names(), vec!["kd_p_l_pl", "kd_p_i_pi"]);
    }

    #[test]
    fn readout_defaults_to_first_product() {
        let net = ReactionNetwork::parse("p+p<->pp\np+i<->pi").expect("parse");
        assert_eq!(net.readout(), "pp");
        assert!(net.readout_defaulted());
    }

    #[test]
    fn readout_marker_may_sit_on_a_reactant() {
        let net = ReactionNetwork::parse("p*+l<->pl").expect("parse");
        assert_eq!(net.readout(), "p");
        assert!(net.is_fundamental("p"));
    }

    #[test]
    fn same_species_marked_twice_is_one_readout() {
        let net = ReactionNetwork::parse("p+l<->pl*, pl*+l<->pll").expect("parse");
        assert_eq!(net.readout(), "pl");
    }

    #[test]
    fn comments_and_blank_segments_are_ignored() {
        let net = ReactionNetwork::parse(
            "# a comment line\n  p + l <-> pl  # trailing comment, p+x<->px\n,,\n",
        )
        .expect("parse");
        assert_eq!(net.reactions().len(), 1);
    }

    #[test]
    fn duplicate_reactions_are_dropped() {
        let net = ReactionNetwork::parse("p+l<->pl, P+L<->PL").expect("parse");
        assert_eq!(net.reactions().len(), 1);
        assert_eq!(net.kd_names(), vec!["kd_p_l_pl"]);
    }

    #[test]
    fn rejects_malformed_networks() {
        assert_err_contains(ReactionNetwork::parse(""), "no reactions");
        assert_err_contains(ReactionNetwork::parse("  # only comment"), "no reactions");
        assert_err_contains(ReactionNetwork::parse("p+l->pl"), "expected '<->'");
        assert_err_contains(ReactionNetwork::parse("p+l+m<->plm"), "exactly two reactants");
        assert_err_contains(ReactionNetwork::parse("p<->pl"), "exactly two reactants");
        assert_err_contains(ReactionNetwork::parse("p+<->pl"), "empty species name");
        assert_err_contains(ReactionNetwork::parse("1p+l<->pl"), "must start with a letter");
        assert_err_contains(ReactionNetwork::parse("p_1+l<->pl"), "ASCII letters and digits");
        assert_err_contains(
            ReactionNetwork::parse("p*+l<->pl*"),
            "more than one readout species marked",
        );
        assert_err_contains(
            ReactionNetwork::parse("p+l<->pl*, p+i<->pi*"),
            "more than one readout species marked: pl, pi",
        );
        assert_err_contains(ReactionNetwork::parse("a+a<->a"), "no fundamental species");
    }

    #[test]
    fn display_uses_dsl_syntax() {
        let reaction = Reaction::new("p", "l", "pl");
        assert_eq!(reaction.to_string(), "p+l<->pl");
        assert_eq!(reaction.kd_name(), "kd_p_l_pl");
    }
}
