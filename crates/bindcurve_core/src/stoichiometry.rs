//! Expresses every species of a network as monomer counts of its fundamental
//! species, and orders the derived species so each is evaluated after all of
//! its reactants.

use crate::network::{NetworkError, Reaction, ReactionNetwork};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct StoichiometryMap {
    fundamental: Vec<String>,
    order: Vec<String>,
    compositions: HashMap<String, Vec<u32>>,
}

impl StoichiometryMap {
    /// Resolves the network, rejecting cycles, inconsistent parallel routes
    /// and ambiguous site-numbered reactions.
    pub fn resolve(network: &ReactionNetwork) -> Result<Self, NetworkError> {
        for reaction in network.reactions() {
            check_site_tags(reaction)?;
        }

        let order = evaluation_order(network)?;
        let fundamental = network.fundamental().to_vec();
        let n = fundamental.len();

        let mut compositions: HashMap<String, Vec<u32>> = HashMap::new();
        for (i, name) in fundamental.iter().enumerate() {
            let mut unit = vec![0; n];
            unit[i] = 1;
            compositions.insert(name.clone(), unit);
        }

        for product in &order {
            let mut composition: Option<Vec<u32>> = None;
            for route in network.routes(product) {
                let combined = combine(&compositions, route);
                match &composition {
                    None => composition = Some(combined),
                    Some(existing) if *existing != combined => {
                        return Err(NetworkError::InconsistentStoichiometry {
                            product: product.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }
            compositions.insert(product.clone(), composition.unwrap_or_else(|| vec![0; n]));
        }

        Ok(Self {
            fundamental,
            order,
            compositions,
        })
    }

    pub fn fundamental(&self) -> &[String] {
        &self.fundamental
    }

    /// Derived species in dependency order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Monomer counts of `species`, indexed like `fundamental()`.
    pub fn composition(&self, species: &str) -> Option<&[u32]> {
        self.compositions.get(species).map(Vec::as_slice)
    }

    /// Number of `fundamental` monomers contained in `species`.
    pub fn count(&self, fundamental: &str, species: &str) -> u32 {
        let Some(idx) = self.fundamental.iter().position(|f| f == fundamental) else {
            return 0;
        };
        self.composition(species).map_or(0, |c| c[idx])
    }
}

fn combine(compositions: &HashMap<String, Vec<u32>>, route: &Reaction) -> Vec<u32> {
    let a = &compositions[&route.reactants[0]];
    let b = &compositions[&route.reactants[1]];
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

/// Orders derived species so every reactant of every route comes first.
fn evaluation_order(network: &ReactionNetwork) -> Result<Vec<String>, NetworkError> {
    let mut resolved: HashSet<&str> = network.fundamental().iter().map(String::as_str).collect();
    let mut order: Vec<String> = Vec::with_capacity(network.derived().len());

    loop {
        let mut progressed = false;
        for product in network.derived() {
            if resolved.contains(product.as_str()) {
                continue;
            }
            let ready = network.routes(product).all(|r| {
                r.reactants
                    .iter()
                    .all(|s| resolved.contains(s.as_str()))
            });
            if ready {
                resolved.insert(product.as_str());
                order.push(product.clone());
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    if order.len() == network.derived().len() {
        return Ok(order);
    }

    let pending: Vec<&str> = network
        .derived()
        .iter()
        .map(String::as_str)
        .filter(|s| !resolved.contains(s))
        .collect();
    let species = pending
        .iter()
        .find(|s| reaches(network, s, s, &pending))
        .or(pending.first())
        .map(|s| s.to_string())
        .unwrap_or_default();
    Err(NetworkError::Cycle { species })
}

/// True if `target` is reachable from the reactants of `from` through unresolved species.
fn reaches(network: &ReactionNetwork, from: &str, target: &str, pending: &[&str]) -> bool {
    let mut stack: Vec<&str> = vec![from];
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(current) = stack.pop() {
        for route in network.routes(current) {
            for reactant in &route.reactants {
                if reactant == target {
                    return true;
                }
                if pending.contains(&reactant.as_str()) && seen.insert(reactant.as_str()) {
                    stack.push(reactant.as_str());
                }
            }
        }
    }
    false
}

/// Digit runs that follow each occurrence of `needle` within `haystack`.
fn site_tags<'a>(haystack: &'a str, needle: &str) -> Vec<&'a str> {
    let mut tags = Vec::new();
    let mut start = 0;
    while let Some(offset) = haystack[start..].find(needle) {
        let loc = start + offset;
        let tail = &haystack[loc + needle.len()..];
        let digits = tail.bytes().take_while(u8::is_ascii_digit).count();
        tags.push(&tail[..digits]);
        start = loc + 1;
        if start >= haystack.len() {
            break;
        }
    }
    tags
}

/// A reaction between numbered species must add exactly one new site tag.
///
/// For `pl1 + l <-> pl1l2` the tag `2` follows `l` in the product but not in
/// `pl1`, so it is the single site contributed by `l`.
fn check_site_tags(reaction: &Reaction) -> Result<(), NetworkError> {
    if !reaction.involves_digits() {
        return Ok(());
    }
    let [r1, r2] = &reaction.reactants;
    let p = &reaction.product;

    let new_tags = |in_product: Vec<&str>, in_partner: Vec<&str>| -> usize {
        let partner: HashSet<&str> = in_partner.into_iter().collect();
        in_product
            .into_iter()
            .filter(|t| !t.is_empty() && !partner.contains(t))
            .collect::<HashSet<_>>()
            .len()
    };

    let missing_from_r1 = new_tags(site_tags(p, r2), site_tags(r1, r2));
    let missing_from_r2 = new_tags(site_tags(p, r1), site_tags(r2, r1));
    let found = missing_from_r1 + missing_from_r2;
    if found != 1 {
        return Err(NetworkError::AmbiguousSiteTag {
            reaction: reaction.to_string(),
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(definition: &str) -> Result<StoichiometryMap, NetworkError> {
        let network = ReactionNetwork::parse(definition)?;
        StoichiometryMap::resolve(&network)
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, NetworkError>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn resolves_chains_of_arbitrary_depth() {
        let map = resolve("p+p<->pp, pp+l<->ppl, ppl+ppl<->big*").expect("resolve");
        assert_eq!(map.count("p", "pp"), 2);
        assert_eq!(map.count("p", "ppl"), 2);
        assert_eq!(map.count("l", "ppl"), 1);
        assert_eq!(map.count("p", "big"), 4);
        assert_eq!(map.count("l", "big"), 2);
        assert_eq!(map.count("p", "p"), 1);
        assert_eq!(map.count("l", "p"), 0);
        assert_eq!(map.order(), &["pp", "ppl", "big"]);
    }

    #[test]
    fn orders_products_after_every_route() {
        // pcu is listed before pu's definition completes in the text.
        let map = resolve("p+c<->pc, pc+u<->pcu, p+u<->pu, pu+c<->pcu*").expect("resolve");
        let pos = |s: &str| map.order().iter().position(|o| o == s).expect("present");
        assert!(pos("pcu") > pos("pc"));
        assert!(pos("pcu") > pos("pu"));
        assert_eq!(map.composition("pcu"), Some(&[1, 1, 1][..]));
    }

    #[test]
    fn accepts_numbered_binding_sites() {
        let map = resolve(
            "P+P<->PP*\nP+L<->PL\nPP+L<->PPL1\nPP+L<->PPL2\nPPL1+L<->PPL1L2\nPPL2+L<->PPL1L2",
        )
        .expect("resolve");
        assert_eq!(map.count("p", "ppl1l2"), 2);
        assert_eq!(map.count("l", "ppl1l2"), 2);
        let map = resolve("p+l<->pl1, p+l<->pl2, pl1+l<->pl1l2, pl2+l<->pl1l2*").expect("resolve");
        assert_eq!(map.count("l", "pl1l2"), 2);
    }

    #[test]
    fn site_tags_collect_digit_runs() {
        assert_eq!(site_tags("ppl1l2", "l"), vec!["1", "2"]);
        assert_eq!(site_tags("ppl1", "pp"), vec![""]);
        assert_eq!(site_tags("pp", "p"), vec!["", ""]);
        assert!(site_tags("l", "pl1").is_empty());
    }

    #[test]
    fn rejects_ambiguous_site_tags() {
        assert_err_contains(resolve("p+l<->pl1l2"), "(2 found)");
        assert_err_contains(resolve("p1+l<->p1l"), "(0 found)");
    }

    #[test]
    fn rejects_cycles() {
        assert_err_contains(resolve("p+pl<->pl"), "species 'pl' is defined in terms of itself");
        assert_err_contains(
            resolve("a+b<->c, c+a<->d, d+x<->c"),
            "is defined in terms of itself",
        );
    }

    #[test]
    fn rejects_inconsistent_parallel_routes() {
        assert_err_contains(
            resolve("p+l<->pl, p+p<->pl"),
            "parallel routes to 'pl' disagree",
        );
    }
}
