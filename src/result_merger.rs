// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Mutex;

use log::debug;

use crate::celestial_record::CelestialRecord;
use crate::coords::angular_separation_deg;
use crate::query::QueryResult;

/// How duplicate records from two sources are reconciled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStrategy {
    /// The local record is the base; missing fields fill from online.
    PreferLocal,
    /// The online record is the base; missing fields fill from local.
    PreferOnline,
    /// The record with the later update wins. The wire formats we
    /// parse carry no update timestamp, so this currently behaves as
    /// MostComplete.
    MostRecent,
    /// Whichever record has more populated fields is the base.
    MostComplete,
    /// No merging: both records are kept (deduplication off).
    Union,
}

/// How a search result matched its query, best first. Orders result
/// ranking after the relevance score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchType {
    Exact,
    Alias,
    Coordinate,
    Fuzzy,
    Filter,
}

impl MatchType {
    /// Base relevance contributed by the match type. Fuzzy matches
    /// degrade with edit distance.
    pub fn score(&self, edit_distance: usize, max_distance: usize) -> f64 {
        let score = match self {
            MatchType::Exact => 1.0,
            MatchType::Alias => 0.9,
            MatchType::Coordinate => 0.8,
            MatchType::Fuzzy => {
                0.7 - (edit_distance as f64 / max_distance.max(1) as f64) * 0.2
            }
            MatchType::Filter => 0.5,
        };
        score.clamp(0.0, 1.0)
    }
}

/// A record with ranking metadata, used when the caller's local search
/// produces relevance-scored output that must merge with online hits.
#[derive(Clone, Debug)]
pub struct ScoredSearchResult {
    pub record: CelestialRecord,
    pub match_type: MatchType,
    pub relevance_score: f64,
    pub edit_distance: usize,
    pub coordinate_distance_deg: f64,
}

impl ScoredSearchResult {
    pub fn new(record: CelestialRecord, match_type: MatchType) -> Self {
        ScoredSearchResult {
            record,
            relevance_score: match_type.score(0, 10),
            match_type,
            edit_distance: 0,
            coordinate_distance_deg: 0.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MergeConfig {
    pub strategy: MergeStrategy,

    pub remove_duplicates: bool,

    /// Two records within this angular distance are coordinate
    /// duplicates. Default is ~3.6 arcseconds.
    pub coordinate_match_radius_deg: f64,
    pub match_by_name: bool,
    pub match_by_coordinates: bool,

    /// Score bonuses applied during scored merges.
    pub local_score_bonus: f64,
    pub online_score_bonus: f64,

    pub max_results: usize,
    pub min_score: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            strategy: MergeStrategy::PreferLocal,
            remove_duplicates: true,
            coordinate_match_radius_deg: 0.001,
            match_by_name: true,
            match_by_coordinates: true,
            local_score_bonus: 0.1,
            online_score_bonus: 0.05,
            max_results: 100,
            min_score: 0.0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MergeStats {
    pub local_count: usize,
    pub online_count: usize,
    pub merged_count: usize,
    pub duplicates_removed: usize,
    pub conflicts_resolved: usize,
}

/// Collapses duplicate records across sources and field-merges them
/// according to the configured strategy. Stateless apart from the
/// statistics of the last merge.
pub struct ResultMerger {
    config: MergeConfig,
    last_stats: Mutex<MergeStats>,
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Levenshtein distance, used for fuzzy-match ranking.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

impl ResultMerger {
    pub fn new(config: MergeConfig) -> Self {
        ResultMerger {
            config,
            last_stats: Mutex::new(MergeStats::default()),
        }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: MergeConfig) {
        self.config = config;
    }

    pub fn last_merge_stats(&self) -> MergeStats {
        self.last_stats.lock().unwrap().clone()
    }

    /// True when `a` and `b` describe the same object under the
    /// configured gates: case- and whitespace-insensitive identifier,
    /// Messier or alias match, or coordinates within the match radius.
    pub fn is_duplicate(&self, a: &CelestialRecord, b: &CelestialRecord) -> bool {
        if self.config.match_by_name {
            if !a.identifier.is_empty()
                && !b.identifier.is_empty()
                && normalize(&a.identifier) == normalize(&b.identifier)
            {
                return true;
            }
            if !a.m_identifier.is_empty()
                && !b.m_identifier.is_empty()
                && normalize(&a.m_identifier) == normalize(&b.m_identifier)
            {
                return true;
            }
            if !a.aliases.is_empty()
                && !b.aliases.is_empty()
                && normalize(&a.aliases) == normalize(&b.aliases)
            {
                return true;
            }
        }

        if self.config.match_by_coordinates {
            let a_has_coords = a.ra_deg != 0.0 || !a.ra_string.is_empty();
            let b_has_coords = b.ra_deg != 0.0 || !b.ra_string.is_empty();
            if a_has_coords && b_has_coords {
                let distance =
                    angular_separation_deg(a.ra_deg, a.dec_deg, b.ra_deg, b.dec_deg);
                if distance <= self.config.coordinate_match_radius_deg {
                    return true;
                }
            }
        }

        false
    }

    /// Merges two duplicates: picks the base per strategy, then fills
    /// every empty base field from the other record.
    pub fn merge_records(
        &self,
        primary: &CelestialRecord,
        secondary: &CelestialRecord,
    ) -> CelestialRecord {
        let (base, source) = match self.config.strategy {
            MergeStrategy::PreferLocal | MergeStrategy::Union => (primary, secondary),
            MergeStrategy::PreferOnline => (secondary, primary),
            MergeStrategy::MostComplete | MergeStrategy::MostRecent => {
                if secondary.non_empty_field_count() > primary.non_empty_field_count() {
                    (secondary, primary)
                } else {
                    (primary, secondary)
                }
            }
        };

        let mut merged = base.clone();
        fill_string(&mut merged.identifier, &source.identifier);
        fill_string(&mut merged.m_identifier, &source.m_identifier);
        fill_string(&mut merged.ngc_identifier, &source.ngc_identifier);
        fill_string(&mut merged.ic_identifier, &source.ic_identifier);
        fill_string(&mut merged.aliases, &source.aliases);
        fill_string(&mut merged.ra_string, &source.ra_string);
        fill_string(&mut merged.dec_string, &source.dec_string);
        fill_string(&mut merged.object_type, &source.object_type);
        fill_string(&mut merged.morphology, &source.morphology);
        fill_string(&mut merged.constellation_en, &source.constellation_en);
        fill_string(&mut merged.constellation_zh, &source.constellation_zh);
        fill_string(&mut merged.detailed_description, &source.detailed_description);
        fill_string(&mut merged.brief_description, &source.brief_description);
        fill_number(&mut merged.ra_deg, source.ra_deg);
        fill_number(&mut merged.dec_deg, source.dec_deg);
        fill_number(&mut merged.visual_magnitude, source.visual_magnitude);
        fill_number(&mut merged.photographic_magnitude, source.photographic_magnitude);
        fill_number(&mut merged.b_minus_v, source.b_minus_v);
        fill_number(&mut merged.surface_brightness, source.surface_brightness);
        fill_number(&mut merged.major_axis_arcmin, source.major_axis_arcmin);
        fill_number(&mut merged.minor_axis_arcmin, source.minor_axis_arcmin);
        fill_number(&mut merged.position_angle_deg, source.position_angle_deg);
        fill_number(&mut merged.distance_parsecs, source.distance_parsecs);
        merged
    }

    /// Merges a local and an online record set. Under `Union` with
    /// deduplication off, both sets pass through verbatim.
    pub fn merge(
        &self,
        local: &[CelestialRecord],
        online: &[CelestialRecord],
    ) -> Vec<CelestialRecord> {
        let mut stats = MergeStats {
            local_count: local.len(),
            online_count: online.len(),
            ..Default::default()
        };

        let mut merged: Vec<CelestialRecord> = local.to_vec();
        let dedup = self.config.remove_duplicates
            && self.config.strategy != MergeStrategy::Union;

        for online_record in online {
            if !dedup {
                merged.push(online_record.clone());
                continue;
            }
            match merged
                .iter()
                .position(|existing| self.is_duplicate(existing, online_record))
            {
                Some(i) => {
                    merged[i] = self.merge_records(&merged[i], online_record);
                    stats.duplicates_removed += 1;
                    stats.conflicts_resolved += 1;
                }
                None => merged.push(online_record.clone()),
            }
        }

        merged.truncate(self.config.max_results);
        stats.merged_count = merged.len();
        debug!(
            "Merged {} local + {} online into {} ({} duplicates removed)",
            stats.local_count, stats.online_count, stats.merged_count,
            stats.duplicates_removed);
        *self.last_stats.lock().unwrap() = stats;
        merged
    }

    /// Merges any number of provider result sets pairwise.
    pub fn merge_multiple(&self, results: &[QueryResult]) -> Vec<CelestialRecord> {
        let mut combined: Vec<CelestialRecord> = vec![];
        for result in results {
            combined = self.merge(&combined, &result.records);
        }
        combined
    }

    /// Merges scored local results with unscored online records.
    /// Local entries that also appear online get the local bonus;
    /// online-only entries enter with `base_online_score` plus the
    /// online bonus. The final ranking is score, then match quality,
    /// then edit distance.
    pub fn merge_scored(
        &self,
        local: &[ScoredSearchResult],
        online: &[CelestialRecord],
        base_online_score: f64,
    ) -> Vec<ScoredSearchResult> {
        let mut stats = MergeStats {
            local_count: local.len(),
            online_count: online.len(),
            ..Default::default()
        };

        let mut merged: Vec<ScoredSearchResult> = local.to_vec();
        for online_record in online {
            match merged
                .iter()
                .position(|existing| self.is_duplicate(&existing.record, online_record))
            {
                Some(i) => {
                    merged[i].record = self.merge_records(&merged[i].record, online_record);
                    merged[i].relevance_score =
                        (merged[i].relevance_score + self.config.local_score_bonus).min(1.0);
                    stats.duplicates_removed += 1;
                    stats.conflicts_resolved += 1;
                }
                None => {
                    let mut scored = ScoredSearchResult::new(
                        online_record.clone(),
                        MatchType::Filter,
                    );
                    scored.relevance_score =
                        (base_online_score + self.config.online_score_bonus).min(1.0);
                    merged.push(scored);
                }
            }
        }

        merged.retain(|result| result.relevance_score >= self.config.min_score);
        merged.sort_by(|a, b| {
            b.relevance_score
                .total_cmp(&a.relevance_score)
                .then(a.match_type.cmp(&b.match_type))
                .then(a.edit_distance.cmp(&b.edit_distance))
        });
        merged.truncate(self.config.max_results);

        stats.merged_count = merged.len();
        *self.last_stats.lock().unwrap() = stats;
        merged
    }
}

fn fill_string(target: &mut String, source: &str) {
    if target.is_empty() && !source.is_empty() {
        *target = source.to_string();
    }
}

fn fill_number(target: &mut f64, source: f64) {
    if *target == 0.0 && source != 0.0 {
        *target = source;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, ra: f64, dec: f64) -> CelestialRecord {
        CelestialRecord {
            identifier: id.to_string(),
            ra_deg: ra,
            ra_string: ra.to_string(),
            dec_deg: dec,
            dec_string: dec.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("", ""), 0);
        assert_eq!(edit_distance("abc", "abc"), 0);
        assert_eq!(edit_distance("abc", "abd"), 1);
        assert_eq!(edit_distance("M31", "M 31"), 1);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
    }

    #[test]
    fn test_identifier_duplicate_is_case_insensitive() {
        let merger = ResultMerger::new(MergeConfig::default());
        let a = record("M31", 10.6847, 41.2689);
        let b = record(" m31 ", 0.0, 0.0);
        assert!(merger.is_duplicate(&a, &b));
    }

    #[test]
    fn test_coordinate_duplicate_within_radius() {
        let merger = ResultMerger::new(MergeConfig::default());
        let a = record("A", 10.6847, 41.2689);
        // 0.0005 degrees away: inside the default 0.001 radius.
        let b = record("B", 10.6847, 41.2694);
        assert!(merger.is_duplicate(&a, &b));

        let c = record("C", 10.6847, 41.3000);
        assert!(!merger.is_duplicate(&a, &c));
    }

    #[test]
    fn test_gates_can_be_disabled() {
        let merger = ResultMerger::new(MergeConfig {
            match_by_name: false,
            match_by_coordinates: false,
            ..Default::default()
        });
        let a = record("M31", 10.6847, 41.2689);
        assert!(!merger.is_duplicate(&a, &a.clone()));
    }

    #[test]
    fn test_prefer_local_fills_missing_fields() {
        // Local type survives; the online description fills in.
        let merger = ResultMerger::new(MergeConfig::default());
        let mut local = record("M31", 10.6847, 41.2689);
        local.object_type = "Galaxy".to_string();
        let mut online = record("M31", 10.6847, 41.2690);
        online.object_type = "Spiral Galaxy".to_string();
        online.brief_description = "Great Andromeda Galaxy".to_string();

        let merged = merger.merge(&[local], &[online]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].object_type, "Galaxy");
        assert_eq!(merged[0].brief_description, "Great Andromeda Galaxy");

        let stats = merger.last_merge_stats();
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(stats.merged_count, 1);
    }

    #[test]
    fn test_prefer_online_base() {
        let merger = ResultMerger::new(MergeConfig {
            strategy: MergeStrategy::PreferOnline,
            ..Default::default()
        });
        let mut local = record("M31", 10.6847, 41.2689);
        local.object_type = "Galaxy".to_string();
        let mut online = record("M31", 10.6847, 41.2689);
        online.object_type = "Spiral Galaxy".to_string();

        let merged = merger.merge(&[local], &[online]);
        assert_eq!(merged[0].object_type, "Spiral Galaxy");
    }

    #[test]
    fn test_most_complete_base() {
        let merger = ResultMerger::new(MergeConfig {
            strategy: MergeStrategy::MostComplete,
            ..Default::default()
        });
        let local = record("M31", 10.6847, 41.2689);
        let mut online = record("M31", 10.6847, 41.2689);
        online.object_type = "Galaxy".to_string();
        online.constellation_en = "And".to_string();
        online.visual_magnitude = 3.44;

        let merged = merger.merge(&[local], &[online]);
        assert_eq!(merged[0].object_type, "Galaxy");
        assert_eq!(merged[0].visual_magnitude, 3.44);
    }

    #[test]
    fn test_union_keeps_both() {
        let merger = ResultMerger::new(MergeConfig {
            strategy: MergeStrategy::Union,
            ..Default::default()
        });
        let a = record("M31", 10.6847, 41.2689);
        let merged = merger.merge(std::slice::from_ref(&a), std::slice::from_ref(&a));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_distinct_records_both_kept() {
        let merger = ResultMerger::new(MergeConfig::default());
        let a = record("M31", 10.6847, 41.2689);
        let b = record("M33", 23.4621, 30.6599);
        let merged = merger.merge(&[a], &[b]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merger.last_merge_stats().duplicates_removed, 0);
    }

    #[test]
    fn test_truncation_at_max_results() {
        let merger = ResultMerger::new(MergeConfig {
            max_results: 2,
            ..Default::default()
        });
        let online: Vec<CelestialRecord> = (0..5)
            .map(|i| record(&format!("NGC{}", i), i as f64, i as f64))
            .collect();
        let merged = merger.merge(&[], &online);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_multiple_collapses_across_providers() {
        let merger = ResultMerger::new(MergeConfig::default());
        let simbad = QueryResult {
            records: vec![record("M31", 10.6847, 41.2689)],
            ..Default::default()
        };
        let ned = QueryResult {
            records: vec![record("M31", 10.6847, 41.2689), record("M33", 23.46, 30.66)],
            ..Default::default()
        };
        let merged = merger.merge_multiple(&[simbad, ned]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_scored_merge_ranking() {
        let merger = ResultMerger::new(MergeConfig::default());
        let exact = ScoredSearchResult::new(record("M31", 10.6847, 41.2689),
                                            MatchType::Exact);
        let fuzzy = ScoredSearchResult::new(record("M 3", 205.5, 28.4),
                                            MatchType::Fuzzy);

        // Online copy of M31 bumps its score; NGC 6946 is online-only.
        let online = vec![
            record("M31", 10.6847, 41.2689),
            record("NGC6946", 308.7, 60.2),
        ];
        let merged = merger.merge_scored(&[exact, fuzzy], &online, 0.5);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].record.identifier, "M31");
        assert!(merged[0].relevance_score > 1.0 - 1e-9);
        // Online-only entry scored base + online bonus.
        let online_only = merged
            .iter()
            .find(|r| r.record.identifier == "NGC6946")
            .unwrap();
        assert!((online_only.relevance_score - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_match_type_scores() {
        assert_eq!(MatchType::Exact.score(0, 10), 1.0);
        assert_eq!(MatchType::Alias.score(0, 10), 0.9);
        assert_eq!(MatchType::Coordinate.score(0, 10), 0.8);
        assert!((MatchType::Fuzzy.score(5, 10) - 0.6).abs() < 1e-9);
        assert_eq!(MatchType::Filter.score(0, 10), 0.5);
    }

}  // mod tests.
