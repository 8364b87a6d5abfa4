//! Particle combinations and their canonicalizing cache.
//!
//! A [`ParticleCombination`] is a node of a decay tree: the final-state
//! particle indices it contains, its daughters, and a non-owning link to its
//! parent. Nodes live in an arena owned by [`ParticleCombinationCache`] and
//! are addressed by [`PcId`]. Identical structure under the same parent always
//! resolves to the same id.
//!
//! Ownership is tracked by a per-slot owner count. Every id handed out by
//! [`ParticleCombinationCache::add_to_cache`], [`ParticleCombinationCache::fsp`]
//! or [`ParticleCombinationCache::composite`] counts as one owner of that root;
//! daughters are owned by their parent. A slot whose owner count drops to zero
//! is expired: lookups skip it and [`ParticleCombinationCache::remove_expired`]
//! frees it.

use pwa_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Arena index of a particle combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PcId(u32);

impl PcId {
    /// Position in the arena.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc#{}", self.0)
    }
}

/// Detached description of a grouping of final-state particles.
///
/// Used to register structure in the cache and as its lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Grouping {
    /// A single final-state particle
    Final(usize),
    /// A composite of two or more daughters, in order
    Composite(Vec<Grouping>),
}

impl Grouping {
    /// Composite of final-state particles, one daughter per index.
    pub fn of_indices(indices: &[usize]) -> Self {
        match indices {
            [i] => Grouping::Final(*i),
            _ => Grouping::Composite(indices.iter().map(|&i| Grouping::Final(i)).collect()),
        }
    }

    /// Final-state indices in daughter order.
    pub fn indices(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_indices(&mut out);
        out
    }

    fn collect_indices(&self, out: &mut Vec<usize>) {
        match self {
            Grouping::Final(i) => out.push(*i),
            Grouping::Composite(ds) => ds.iter().for_each(|d| d.collect_indices(out)),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Grouping::Composite(ds) = self {
            if ds.len() < 2 {
                return Err(Error::CacheContract(format!(
                    "composite particle combination needs at least 2 daughters, got {}",
                    ds.len()
                )));
            }
            for d in ds {
                d.validate()?;
            }
        }
        let indices = self.indices();
        let unique: BTreeSet<_> = indices.iter().collect();
        if unique.len() != indices.len() {
            return Err(Error::CacheContract(format!(
                "daughters overlap in particle combination {}",
                indices_string(&indices)
            )));
        }
        Ok(())
    }
}

/// One node of a decay tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleCombination {
    indices: Vec<usize>,
    daughters: Vec<PcId>,
    parent: Option<PcId>,
}

impl ParticleCombination {
    /// Final-state particle indices, in daughter order.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Daughter combinations.
    pub fn daughters(&self) -> &[PcId] {
        &self.daughters
    }

    /// Parent combination, if this node sits inside a larger decay.
    pub fn parent(&self) -> Option<PcId> {
        self.parent
    }

    /// `true` for a single final-state particle.
    pub fn is_final_state(&self) -> bool {
        self.daughters.is_empty()
    }

    /// Indices sorted ascending.
    pub fn sorted_indices(&self) -> Vec<usize> {
        let mut v = self.indices.clone();
        v.sort_unstable();
        v
    }
}

/// Rule deciding when two combinations share a symmetrization index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Equivalence {
    /// Same arena node
    #[default]
    Identity,
    /// Same indices in the same order
    OrderedContent,
    /// Same indices in any order
    OrderlessContent,
    /// Same ordered content, recursively down through the daughters
    Down,
    /// [`Equivalence::Down`] plus ordered-content equality of every ancestor
    UpAndDown,
    /// Orderless content, and every daughter matches some daughter by orderless content
    DownByOrderlessContent,
    /// Orderless content, and every ancestor matches by orderless content
    ReferenceFrame,
}

#[derive(Debug, Clone)]
struct Slot {
    pc: ParticleCombination,
    owners: u32,
}

/// Arena of particle combinations with canonical lookup.
#[derive(Debug, Clone, Default)]
pub struct ParticleCombinationCache {
    slots: Vec<Option<Slot>>,
    lookup: HashMap<(Option<PcId>, Grouping), PcId>,
}

impl ParticleCombinationCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `grouping` as a root combination and take one ownership of it.
    ///
    /// Structurally identical groupings resolve to the same id.
    pub fn add_to_cache(&mut self, grouping: &Grouping) -> Result<PcId> {
        grouping.validate()?;
        let id = self.insert(grouping, None);
        Ok(id)
    }

    /// Root combination of the single final-state particle `index`.
    pub fn fsp(&mut self, index: usize) -> PcId {
        self.insert(&Grouping::Final(index), None)
    }

    /// Root composite of `daughters`.
    ///
    /// The new node receives its own parented copies of each daughter's
    /// structure.
    pub fn composite(&mut self, daughters: &[PcId]) -> Result<PcId> {
        let groupings =
            daughters.iter().map(|&d| self.grouping(d)).collect::<Result<Vec<_>>>()?;
        self.add_to_cache(&Grouping::Composite(groupings))
    }

    fn insert(&mut self, grouping: &Grouping, parent: Option<PcId>) -> PcId {
        let key = (parent, grouping.clone());
        if let Some(&id) = self.lookup.get(&key)
            && self.is_live(id)
        {
            if let Some(slot) = self.slots[id.index()].as_mut() {
                slot.owners += 1;
            }
            return id;
        }

        let id = PcId(self.slots.len() as u32);
        self.slots.push(Some(Slot {
            pc: ParticleCombination { indices: Vec::new(), daughters: Vec::new(), parent },
            owners: 1,
        }));

        let (indices, daughters) = match grouping {
            Grouping::Final(i) => (vec![*i], Vec::new()),
            Grouping::Composite(children) => {
                let daughters: Vec<PcId> =
                    children.iter().map(|c| self.insert(c, Some(id))).collect();
                (grouping.indices(), daughters)
            }
        };
        if let Some(slot) = self.slots[id.index()].as_mut() {
            slot.pc.indices = indices;
            slot.pc.daughters = daughters;
        }
        self.lookup.insert(key, id);
        id
    }

    fn slot(&self, id: PcId) -> Option<&Slot> {
        self.slots.get(id.index()).and_then(|s| s.as_ref()).filter(|s| s.owners > 0)
    }

    /// `true` while at least one owner holds `id`.
    pub fn is_live(&self, id: PcId) -> bool {
        self.slot(id).is_some()
    }

    /// Reverse lookup; `None` for unknown or expired ids.
    pub fn find(&self, id: PcId) -> Option<&ParticleCombination> {
        self.slot(id).map(|s| &s.pc)
    }

    /// Like [`Self::find`], but an expired id is a contract violation.
    pub fn get(&self, id: PcId) -> Result<&ParticleCombination> {
        self.find(id).ok_or_else(|| {
            Error::CacheContract(format!("{id} is not a live particle combination"))
        })
    }

    /// Root combination with exactly this structure.
    pub fn find_grouping(&self, grouping: &Grouping) -> Option<PcId> {
        self.lookup.get(&(None, grouping.clone())).copied().filter(|&id| self.is_live(id))
    }

    /// Root combination built directly from the final-state particles `indices`.
    pub fn find_by_indices(&self, indices: &[usize]) -> Option<PcId> {
        self.find_grouping(&Grouping::of_indices(indices))
    }

    /// Root composite whose daughters have the structure of `daughters`, in order.
    pub fn find_by_daughters(&self, daughters: &[PcId]) -> Option<PcId> {
        let groupings = daughters.iter().map(|&d| self.grouping(d).ok()).collect::<Option<_>>()?;
        self.find_grouping(&Grouping::Composite(groupings))
    }

    /// Earliest-registered live root whose content equals `indices` in any order.
    pub fn find_by_unordered_content(&self, indices: &[usize]) -> Option<PcId> {
        let mut wanted = indices.to_vec();
        wanted.sort_unstable();
        self.iter()
            .find(|(_, pc)| pc.parent.is_none() && pc.sorted_indices() == wanted)
            .map(|(id, _)| id)
    }

    /// Detached structure of `id`.
    pub fn grouping(&self, id: PcId) -> Result<Grouping> {
        let pc = self.get(id)?;
        if pc.is_final_state() {
            return Ok(Grouping::Final(pc.indices[0]));
        }
        Ok(Grouping::Composite(
            pc.daughters.iter().map(|&d| self.grouping(d)).collect::<Result<_>>()?,
        ))
    }

    /// Top-most ancestor of `id`.
    pub fn origin(&self, id: PcId) -> PcId {
        let mut cur = id;
        while let Some(p) = self.find(cur).and_then(|pc| pc.parent) {
            cur = p;
        }
        cur
    }

    /// Take one more ownership of a live node.
    pub fn retain(&mut self, id: PcId) -> Result<()> {
        self.get(id)?;
        if let Some(slot) = self.slots[id.index()].as_mut() {
            slot.owners += 1;
        }
        Ok(())
    }

    /// Give up one ownership; the last release expires the node and its daughters.
    pub fn release(&mut self, id: PcId) -> Result<()> {
        self.get(id)?;
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            let Some(slot) = self.slots[cur.index()].as_mut() else { continue };
            slot.owners = slot.owners.saturating_sub(1);
            if slot.owners == 0 {
                stack.extend(slot.pc.daughters.iter().copied());
            }
        }
        Ok(())
    }

    /// Free all expired slots and their lookup entries. Returns the number removed.
    ///
    /// Ids are never reused.
    pub fn remove_expired(&mut self) -> usize {
        let mut removed = 0;
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.owners == 0) {
                *slot = None;
                removed += 1;
            }
        }
        let slots = &self.slots;
        self.lookup.retain(|_, id| slots.get(id.index()).is_some_and(|s| s.is_some()));
        if removed > 0 {
            log::debug!("removed {removed} expired particle combinations");
        }
        removed
    }

    /// Number of live combinations.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// `true` if no live combination is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live combinations in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (PcId, &ParticleCombination)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.as_ref().filter(|s| s.owners > 0).map(|s| (PcId(i as u32), &s.pc))
        })
    }

    /// Verify the bookkeeping of every live node.
    ///
    /// Reports every problem found, not just the first.
    pub fn check_consistency(&self) -> Result<()> {
        let mut problems = Vec::new();
        for (id, pc) in self.iter() {
            let label = self.describe(id);
            if pc.daughters.len() == 1 {
                problems.push(format!("{label}: has only one daughter"));
            }
            if pc.indices.is_empty() {
                problems.push(format!("{label}: has no indices"));
            }
            if pc.daughters.is_empty() {
                if pc.indices.len() != 1 {
                    problems.push(format!(
                        "{label}: final-state particle holds {} indices",
                        pc.indices.len()
                    ));
                }
                continue;
            }
            let unique: BTreeSet<_> = pc.indices.iter().collect();
            if unique.len() != pc.indices.len() {
                problems.push(format!("{label}: duplicate indices"));
            }
            for &d in &pc.daughters {
                match self.find(d) {
                    None => problems.push(format!("{label}: daughter {d} has expired")),
                    Some(dpc) if dpc.parent != Some(id) => {
                        problems.push(format!("{label}: daughter {d} has a different parent"))
                    }
                    Some(_) => {}
                }
            }
            let concatenated: Vec<usize> = pc
                .daughters
                .iter()
                .filter_map(|&d| self.find(d))
                .flat_map(|d| d.indices.iter().copied())
                .collect();
            if concatenated != pc.indices {
                problems.push(format!("{label}: indices differ from daughters' indices"));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::CacheContract(format!(
                "inconsistent particle combination cache: {}",
                problems.join("; ")
            )))
        }
    }

    /// `true` if [`Self::check_consistency`] finds nothing.
    pub fn consistent(&self) -> bool {
        self.check_consistency().is_ok()
    }

    /// `true` if no two of `ids` share a final-state index.
    pub fn disjoint(&self, ids: &[PcId]) -> bool {
        let mut seen = BTreeSet::new();
        ids.iter()
            .filter_map(|&id| self.find(id))
            .flat_map(|pc| pc.indices.iter())
            .all(|i| seen.insert(*i))
    }

    /// Whether `a` and `b` are equivalent under `eq`.
    pub fn equivalent(&self, eq: Equivalence, a: PcId, b: PcId) -> bool {
        if a == b {
            return self.is_live(a);
        }
        let (Some(pa), Some(pb)) = (self.find(a), self.find(b)) else {
            return false;
        };
        match eq {
            Equivalence::Identity => false,
            Equivalence::OrderedContent => pa.indices == pb.indices,
            Equivalence::OrderlessContent => pa.sorted_indices() == pb.sorted_indices(),
            Equivalence::Down => self.equal_down(a, b),
            Equivalence::UpAndDown => {
                self.equal_down(a, b) && self.equal_up(pa.parent, pb.parent, false)
            }
            Equivalence::DownByOrderlessContent => {
                pa.sorted_indices() == pb.sorted_indices()
                    && pa.daughters.len() == pb.daughters.len()
                    && pa.daughters.iter().all(|&da| {
                        pb.daughters
                            .iter()
                            .any(|&db| self.equivalent(Equivalence::OrderlessContent, da, db))
                    })
            }
            Equivalence::ReferenceFrame => {
                pa.sorted_indices() == pb.sorted_indices()
                    && self.equal_up(pa.parent, pb.parent, true)
            }
        }
    }

    fn equal_down(&self, a: PcId, b: PcId) -> bool {
        if a == b {
            return true;
        }
        let (Some(pa), Some(pb)) = (self.find(a), self.find(b)) else {
            return false;
        };
        pa.indices == pb.indices
            && pa.daughters.len() == pb.daughters.len()
            && pa.daughters.iter().zip(&pb.daughters).all(|(&x, &y)| self.equal_down(x, y))
    }

    fn equal_up(&self, a: Option<PcId>, b: Option<PcId>, orderless: bool) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                if a == b {
                    return true;
                }
                let (Some(pa), Some(pb)) = (self.find(a), self.find(b)) else {
                    return false;
                };
                let same = if orderless {
                    pa.sorted_indices() == pb.sorted_indices()
                } else {
                    pa.indices == pb.indices
                };
                same && self.equal_up(pa.parent, pb.parent, orderless)
            }
            _ => false,
        }
    }

    /// Text such as `(012) -> (01) + (2); (01) -> (0) + (1)`.
    pub fn describe(&self, id: PcId) -> String {
        let Some(pc) = self.find(id) else {
            return format!("{id} (expired)");
        };
        let mut s = indices_string(&pc.indices);
        if pc.is_final_state() {
            return s;
        }
        let parts: Vec<String> = pc
            .daughters
            .iter()
            .map(|&d| self.find(d).map(|d| indices_string(&d.indices)).unwrap_or_default())
            .collect();
        s.push_str(" -> ");
        s.push_str(&parts.join(" + "));
        for &d in &pc.daughters {
            if self.find(d).is_some_and(|d| !d.is_final_state()) {
                s.push_str("; ");
                s.push_str(&self.describe(d));
            }
        }
        s
    }
}

fn indices_string(indices: &[usize]) -> String {
    if indices.is_empty() {
        return "(empty)".into();
    }
    let body: String = indices.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("");
    format!("({body})")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_body() -> (ParticleCombinationCache, PcId, PcId) {
        let mut c = ParticleCombinationCache::new();
        let p0 = c.fsp(0);
        let p1 = c.fsp(1);
        let p2 = c.fsp(2);
        let r01 = c.composite(&[p0, p1]).unwrap();
        let top = c.composite(&[r01, p2]).unwrap();
        (c, r01, top)
    }

    #[test]
    fn test_fsp_is_canonical() {
        let mut c = ParticleCombinationCache::new();
        let a = c.fsp(3);
        let b = c.fsp(3);
        assert_eq!(a, b);
        assert_eq!(c.find(a).unwrap().indices(), &[3]);
    }

    #[test]
    fn test_registering_twice_returns_same_id() {
        let mut c = ParticleCombinationCache::new();
        let g = Grouping::of_indices(&[0, 1]);
        let a = c.add_to_cache(&g).unwrap();
        let b = c.add_to_cache(&g).unwrap();
        assert_eq!(a, b);
        assert_eq!(c.find_by_indices(&[0, 1]), Some(a));
    }

    #[test]
    fn test_composite_builds_parented_lineage() {
        let (c, r01, top) = three_body();
        let top_pc = c.find(top).unwrap();
        assert_eq!(top_pc.indices(), &[0, 1, 2]);
        let copy = top_pc.daughters()[0];
        assert_ne!(copy, r01);
        assert_eq!(c.find(copy).unwrap().parent(), Some(top));
        assert_eq!(c.origin(copy), top);
        assert_eq!(c.origin(c.find(copy).unwrap().daughters()[1]), top);
        assert!(c.equivalent(Equivalence::Down, copy, r01));
        assert!(!c.equivalent(Equivalence::UpAndDown, copy, r01));
        assert!(c.consistent());
    }

    #[test]
    fn test_unordered_content_lookup() {
        let mut c = ParticleCombinationCache::new();
        let a = c.add_to_cache(&Grouping::of_indices(&[1, 0])).unwrap();
        let b = c.add_to_cache(&Grouping::of_indices(&[0, 1])).unwrap();
        assert_ne!(a, b);
        assert_eq!(c.find_by_unordered_content(&[0, 1]), Some(a));
        assert_eq!(c.find_by_unordered_content(&[1, 0]), Some(a));
        assert!(c.equivalent(Equivalence::OrderlessContent, a, b));
        assert!(!c.equivalent(Equivalence::OrderedContent, a, b));
    }

    #[test]
    fn test_overlapping_daughters_rejected() {
        let mut c = ParticleCombinationCache::new();
        let p0 = c.fsp(0);
        let err = c.composite(&[p0, p0]).unwrap_err();
        assert!(err.is_contract_violation());
        let single = c.add_to_cache(&Grouping::Composite(vec![Grouping::Final(0)]));
        assert!(single.is_err());
    }

    #[test]
    fn test_release_expires_and_prunes() {
        let (mut c, r01, top) = three_body();
        let copy = c.find(top).unwrap().daughters()[0];
        c.release(top).unwrap();
        assert!(!c.is_live(top));
        assert!(!c.is_live(copy));
        assert!(c.is_live(r01));
        let p2 = c.fsp(2);
        assert_eq!(c.find_by_daughters(&[r01, p2]), None);
        let removed = c.remove_expired();
        assert_eq!(removed, 1 + 2 + 2);
        assert!(c.consistent());

        // re-registering after expiry yields a fresh node
        let again = c.composite(&[r01, p2]).unwrap();
        assert_ne!(again, top);
        assert!(c.is_live(again));
    }

    #[test]
    fn test_shared_root_survives_one_release() {
        let mut c = ParticleCombinationCache::new();
        let g = Grouping::of_indices(&[0, 1]);
        let a = c.add_to_cache(&g).unwrap();
        c.add_to_cache(&g).unwrap();
        c.release(a).unwrap();
        assert!(c.is_live(a));
        c.release(a).unwrap();
        assert!(!c.is_live(a));
        assert!(c.get(a).is_err());
    }

    #[test]
    fn test_reference_frame_and_orderless_down() {
        let mut c = ParticleCombinationCache::new();
        let t1 = c.add_to_cache(&Grouping::Composite(vec![
            Grouping::of_indices(&[0, 1]),
            Grouping::Final(2),
        ]))
        .unwrap();
        let t2 = c.add_to_cache(&Grouping::Composite(vec![
            Grouping::Final(2),
            Grouping::of_indices(&[1, 0]),
        ]))
        .unwrap();
        assert!(c.equivalent(Equivalence::DownByOrderlessContent, t1, t2));
        let d1 = c.find(t1).unwrap().daughters()[0];
        let d2 = c.find(t2).unwrap().daughters()[1];
        assert!(c.equivalent(Equivalence::ReferenceFrame, d1, d2));
        assert!(!c.equivalent(Equivalence::UpAndDown, d1, d2));
    }

    #[test]
    fn test_describe() {
        let (c, _, top) = three_body();
        assert_eq!(c.describe(top), "(012) -> (01) + (2); (01) -> (0) + (1)");
        assert!(c.disjoint(&c.find(top).unwrap().daughters().to_vec()));
    }
}
