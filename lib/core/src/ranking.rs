//! Keep/delete ordering within a similarity group.
//!
//! A [`RankingPolicy`] is a comparator where `Less` means "keep before".
//! Whatever the policy, ties fall back to the identity string so the order is
//! total and reproducible.

use crate::{FingerprintRecord, ImageIdentity};
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// What a policy may look at when ordering group members.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub identity: ImageIdentity,
    pub computed_at: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub metadata: Option<serde_json::Value>,
}

impl Candidate {
    pub fn bare(identity: ImageIdentity) -> Self {
        Self {
            identity,
            computed_at: None,
            file_size: None,
            width: None,
            height: None,
            metadata: None,
        }
    }

    pub fn pixel_count(&self) -> Option<u64> {
        Some(u64::from(self.width?) * u64::from(self.height?))
    }
}

impl From<&FingerprintRecord> for Candidate {
    fn from(record: &FingerprintRecord) -> Self {
        Self {
            identity: record.identity.clone(),
            computed_at: record.computed_at,
            file_size: record.file_size,
            width: record.width,
            height: record.height,
            metadata: record.metadata.clone(),
        }
    }
}

pub trait RankingPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering;
}

// Present values rank ahead of missing ones; larger ahead of smaller.
fn larger_first<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Most recently computed first.
#[derive(Debug, Clone, Copy, Default)]
pub struct Newest;

impl RankingPolicy for Newest {
    fn name(&self) -> &str {
        "newest"
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        larger_first(a.computed_at, b.computed_at)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LargestFile;

impl RankingPolicy for LargestFile {
    fn name(&self) -> &str {
        "largest_file"
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        larger_first(a.file_size, b.file_size)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LargestDimensions;

impl RankingPolicy for LargestDimensions {
    fn name(&self) -> &str {
        "largest_dimensions"
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        larger_first(a.pixel_count(), b.pixel_count())
    }
}

/// Highest externally computed score first (for example a text-value score).
pub struct ValueScore<F> {
    score: F,
}

impl<F> ValueScore<F>
where
    F: Fn(&Candidate) -> f64 + Send + Sync,
{
    pub fn new(score: F) -> Self {
        Self { score }
    }
}

impl<F> RankingPolicy for ValueScore<F>
where
    F: Fn(&Candidate) -> f64 + Send + Sync,
{
    fn name(&self) -> &str {
        "value_score"
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        OrderedFloat((self.score)(b)).cmp(&OrderedFloat((self.score)(a)))
    }
}

/// Applies each policy in turn until one distinguishes the candidates.
pub struct Chain {
    policies: Vec<Box<dyn RankingPolicy>>,
}

impl Chain {
    pub fn new(policies: Vec<Box<dyn RankingPolicy>>) -> Self {
        Self { policies }
    }

    /// Larger pixel dimensions, then larger file.
    pub fn quality() -> Self {
        Self::new(vec![Box::new(LargestDimensions), Box::new(LargestFile)])
    }

    pub fn then(mut self, policy: impl RankingPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::quality()
    }
}

impl RankingPolicy for Chain {
    fn name(&self) -> &str {
        "chain"
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        self.policies
            .iter()
            .map(|p| p.compare(a, b))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

/// Resolves a built-in policy by name.
pub fn policy_by_name(name: &str) -> Option<Box<dyn RankingPolicy>> {
    match name {
        "quality" | "chain" => Some(Box::new(Chain::quality())),
        "newest" => Some(Box::new(Newest)),
        "largest_file" | "size" => Some(Box::new(LargestFile)),
        "largest_dimensions" | "dimensions" => Some(Box::new(LargestDimensions)),
        _ => None,
    }
}

/// Per-group verdict: one identity to keep, the rest to delete in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDecision {
    pub keep: ImageIdentity,
    pub delete: Vec<ImageIdentity>,
}

impl RankedDecision {
    /// Full order from keep to delete.
    pub fn order(&self) -> impl Iterator<Item = &ImageIdentity> {
        std::iter::once(&self.keep).chain(self.delete.iter())
    }
}

/// Orders `candidates` with `policy`, falling back to identity order on ties.
/// Returns `None` for an empty slice.
pub fn rank_group(mut candidates: Vec<Candidate>, policy: &dyn RankingPolicy) -> Option<RankedDecision> {
    candidates.sort_by(|a, b| policy.compare(a, b).then_with(|| a.identity.cmp(&b.identity)));
    let mut ordered = candidates.into_iter().map(|c| c.identity);
    let keep = ordered.next()?;
    Some(RankedDecision {
        keep,
        delete: ordered.collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate(id: &str, file_size: Option<u64>, dims: Option<(u32, u32)>) -> Candidate {
        let mut c = Candidate::bare(ImageIdentity::new(id));
        c.file_size = file_size;
        if let Some((w, h)) = dims {
            c.width = Some(w);
            c.height = Some(h);
        }
        c
    }

    fn keep_then_delete(d: &RankedDecision) -> Vec<&str> {
        d.order().map(|i| i.as_str()).collect()
    }

    #[test]
    fn test_quality_chain() {
        let group = vec![
            candidate("c.jpg", Some(900), Some((100, 100))),
            candidate("a.jpg", Some(100), Some((200, 200))),
            candidate("b.jpg", Some(500), Some((100, 100))),
        ];
        let decision = rank_group(group, &Chain::quality()).unwrap();
        assert_eq!(keep_then_delete(&decision), vec!["a.jpg", "c.jpg", "b.jpg"]);
    }

    #[test]
    fn test_ties_break_on_identity() {
        let group = vec![
            candidate("z.png", Some(10), None),
            candidate("m.png", Some(10), None),
            candidate("a.png", Some(10), None),
        ];
        let decision = rank_group(group, &LargestFile).unwrap();
        assert_eq!(decision.keep.as_str(), "a.png");
        assert_eq!(keep_then_delete(&decision), vec!["a.png", "m.png", "z.png"]);
    }

    #[test]
    fn test_missing_values_rank_last() {
        let group = vec![candidate("a", None, None), candidate("b", Some(1), None)];
        let decision = rank_group(group, &LargestFile).unwrap();
        assert_eq!(decision.keep.as_str(), "b");
    }

    #[test]
    fn test_newest() {
        let mut old = candidate("old", None, None);
        old.computed_at = Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        let mut new = candidate("new", None, None);
        new.computed_at = Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());

        let decision = rank_group(vec![old, new], &Newest).unwrap();
        assert_eq!(decision.keep.as_str(), "new");
        assert_eq!(decision.delete.len(), 1);
    }

    #[test]
    fn test_value_score_policy() {
        let score = ValueScore::new(|c: &Candidate| {
            c.metadata
                .as_ref()
                .and_then(|m| m.get("text_value"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
        });
        let mut low = candidate("low", None, None);
        low.metadata = Some(serde_json::json!({"text_value": 0.2}));
        let mut high = candidate("high", None, None);
        high.metadata = Some(serde_json::json!({"text_value": 0.9}));

        let decision = rank_group(vec![low, high], &score).unwrap();
        assert_eq!(decision.keep.as_str(), "high");
    }

    #[test]
    fn test_empty_group() {
        assert!(rank_group(Vec::new(), &Newest).is_none());
    }

    #[test]
    fn test_policy_by_name() {
        assert_eq!(policy_by_name("newest").unwrap().name(), "newest");
        assert_eq!(policy_by_name("quality").unwrap().name(), "chain");
        assert!(policy_by_name("random").is_none());
    }
}
