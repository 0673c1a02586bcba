//! Optional stage 1, step 3: fold exploded parts back together by adjacency.
//!
//! For every group of parts sharing an `orig_id` the first rule that applies
//! wins:
//! 1. the parts are contiguous among themselves and are re-unioned;
//! 2. one neighbouring polygon touches every part and absorbs them;
//! 3. a pair of adjacent neighbours together touches every part and
//!    absorbs them.
//!
//! Groups matching none of the rules are left split.

use anyhow::Result;
use geo::{unary_union, BooleanOps, BoundingRect, MultiPolygon, Rect};
use hashbrown::HashSet;
use tracing::{debug, info};

use crate::error::ProcessError;
use crate::geometry::{shared_boundary_length, touches};
use crate::index::PolygonIndex;
use crate::models::{CensusPolygon, PolygonLayer};
use crate::multipart::{pad_id, RelabelOptions};

pub const DEFAULT_MIN_SHARED_LEN: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct ContiguityOptions {
    /// Minimum shared boundary, in CRS units, for two polygons to count as adjacent
    pub min_shared_len: f64,
    pub id_length: usize,
    pub numeric_columns: Vec<String>,
    pub count_columns: Vec<String>,
    /// Weight for population-weighted averages
    pub population_column: String,
}

impl ContiguityOptions {
    pub fn from_relabel(relabel: &RelabelOptions, population_column: &str) -> Self {
        Self {
            min_shared_len: DEFAULT_MIN_SHARED_LEN,
            id_length: relabel.id_length,
            numeric_columns: relabel.numeric_columns.clone(),
            count_columns: relabel.count_columns.clone(),
            population_column: population_column.to_string(),
        }
    }
}

/// Outcome counters of one resolution pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ContiguityStats {
    pub groups: usize,
    pub reunited: usize,
    pub single_neighbour: usize,
    pub neighbour_pair: usize,
    pub unresolved: usize,
}

#[derive(Debug)]
pub struct ContiguityResolver {
    options: ContiguityOptions,
}

/// A group of exploded parts sharing one original identifier
struct PartGroup {
    orig_id: String,
    members: Vec<usize>,
}

/// How a group gets absorbed
enum Resolution {
    Reunite,
    Absorb(Vec<usize>),
}

impl ContiguityResolver {
    pub fn new(options: ContiguityOptions) -> Result<Self> {
        if !options
            .numeric_columns
            .iter()
            .any(|c| c == &options.population_column)
        {
            return Err(ProcessError::InvalidConfig(format!(
                "population column '{}' is not among the numeric columns",
                options.population_column
            ))
            .into());
        }
        if options.min_shared_len.is_nan() || options.min_shared_len < 0.0 {
            return Err(ProcessError::InvalidConfig(format!(
                "min_shared_len must be non-negative, got {}",
                options.min_shared_len
            ))
            .into());
        }
        Ok(Self { options })
    }

    /// Resolve every multipart group of a relabelled layer.
    ///
    /// Output order: untouched single-part records, resolved records, then
    /// parts of groups that could not be resolved.
    pub fn resolve(&self, layer: &PolygonLayer) -> (PolygonLayer, ContiguityStats) {
        let records = &layer.records;

        let mut groups: Vec<PartGroup> = Vec::new();
        let mut singles: Vec<usize> = Vec::new();
        for (i, record) in records.iter().enumerate() {
            if record.was_multipart != Some(true) {
                singles.push(i);
                continue;
            }
            let orig_id = record
                .orig_id
                .clone()
                .unwrap_or_else(|| record.poly_id.clone());
            match groups.iter_mut().find(|g| g.orig_id == orig_id) {
                Some(group) => group.members.push(i),
                None => groups.push(PartGroup {
                    orig_id,
                    members: vec![i],
                }),
            }
        }

        let single_index = PolygonIndex::build(singles.iter().map(|&i| &records[i].geometry));
        let mut used_ids: HashSet<String> = records.iter().map(|r| r.poly_id.clone()).collect();
        let mut consumed: HashSet<usize> = HashSet::new();
        let mut resolved = Vec::new();
        let mut leftover = Vec::new();
        let mut stats = ContiguityStats {
            groups: groups.len(),
            ..ContiguityStats::default()
        };

        for group in &groups {
            let parts: Vec<&CensusPolygon> = group.members.iter().map(|&i| &records[i]).collect();

            let resolution = if self.parts_contiguous(&parts) {
                Some(Resolution::Reunite)
            } else {
                let neighbours: Vec<usize> = group_envelope(&parts)
                    .map(|rect| single_index.candidates(&rect))
                    .unwrap_or_default()
                    .into_iter()
                    .map(|pos| singles[pos])
                    .filter(|i| !consumed.contains(i))
                    .collect();

                self.best_single_neighbour(&parts, &neighbours, records)
                    .map(|n| Resolution::Absorb(vec![n]))
                    .or_else(|| {
                        self.best_neighbour_pair(&parts, &neighbours, records)
                            .map(|(a, b)| Resolution::Absorb(vec![a, b]))
                    })
            };

            match resolution {
                Some(Resolution::Reunite) => {
                    debug!("Parts of {} are contiguous, reuniting", group.orig_id);
                    stats.reunited += 1;
                    resolved.push(self.reunite(&group.orig_id, &parts));
                }
                Some(Resolution::Absorb(targets)) => {
                    let target_records: Vec<&CensusPolygon> =
                        targets.iter().map(|&i| &records[i]).collect();
                    debug!(
                        "Parts of {} absorbed by {}",
                        group.orig_id,
                        target_records
                            .iter()
                            .map(|t| t.poly_id.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    if targets.len() == 1 {
                        stats.single_neighbour += 1;
                    } else {
                        stats.neighbour_pair += 1;
                    }
                    let new_id = self.generate_id(&group.orig_id, &mut used_ids);
                    resolved.push(self.absorb(&group.orig_id, &parts, &target_records, new_id));
                    consumed.extend(targets);
                }
                None => {
                    stats.unresolved += 1;
                    leftover.extend(group.members.iter().map(|&i| records[i].clone()));
                }
            }
        }

        let mut output: Vec<CensusPolygon> = singles
            .iter()
            .filter(|i| !consumed.contains(*i))
            .map(|&i| records[i].clone())
            .collect();
        output.extend(resolved);
        output.extend(leftover);

        info!(
            "Contiguity: {} groups, {} reunited, {} merged with one neighbour, {} with two, {} left split",
            stats.groups,
            stats.reunited,
            stats.single_neighbour,
            stats.neighbour_pair,
            stats.unresolved
        );

        (layer.with_records(output), stats)
    }

    fn adjacent(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Option<f64> {
        if !touches(a, b) {
            return None;
        }
        let shared = shared_boundary_length(a, b);
        (shared >= self.options.min_shared_len).then_some(shared)
    }

    /// Every part shares enough boundary with at least one other part
    fn parts_contiguous(&self, parts: &[&CensusPolygon]) -> bool {
        if parts.len() < 2 {
            return true;
        }
        parts.iter().enumerate().all(|(i, a)| {
            parts
                .iter()
                .enumerate()
                .any(|(j, b)| i != j && self.adjacent(&a.geometry, &b.geometry).is_some())
        })
    }

    /// Neighbour adjacent to every part with the largest total shared boundary
    fn best_single_neighbour(
        &self,
        parts: &[&CensusPolygon],
        neighbours: &[usize],
        records: &[CensusPolygon],
    ) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for &n in neighbours {
            let candidate = &records[n].geometry;
            let total: Option<f64> = parts
                .iter()
                .map(|p| self.adjacent(candidate, &p.geometry))
                .sum();
            if let Some(total) = total {
                if total > best.map_or(0.0, |(_, s)| s) {
                    best = Some((n, total));
                }
            }
        }
        best.map(|(n, _)| n)
    }

    /// Adjacent pair of neighbours that together touch every part, ranked by
    /// shared boundary with the parts and then with each other
    fn best_neighbour_pair(
        &self,
        parts: &[&CensusPolygon],
        neighbours: &[usize],
        records: &[CensusPolygon],
    ) -> Option<(usize, usize)> {
        // (record, touched part positions, shared length with those parts)
        let touching: Vec<(usize, Vec<usize>, f64)> = neighbours
            .iter()
            .filter_map(|&n| {
                let candidate = &records[n].geometry;
                let touched: Vec<usize> = parts
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| touches(candidate, &p.geometry))
                    .map(|(k, _)| k)
                    .collect();
                if touched.is_empty() {
                    return None;
                }
                let shared = touched
                    .iter()
                    .map(|&k| shared_boundary_length(candidate, &parts[k].geometry))
                    .sum();
                Some((n, touched, shared))
            })
            .collect();

        let mut best: Option<(usize, usize, f64, f64)> = None;
        for (i, (a, touched_a, shared_a)) in touching.iter().enumerate() {
            for (b, touched_b, shared_b) in touching.iter().skip(i + 1) {
                let Some(between) = self.adjacent(&records[*a].geometry, &records[*b].geometry)
                else {
                    continue;
                };
                let covers_all =
                    (0..parts.len()).all(|k| touched_a.contains(&k) || touched_b.contains(&k));
                if !covers_all {
                    continue;
                }
                let total = shared_a + shared_b;
                let better = match best {
                    None => true,
                    Some((_, _, best_total, best_between)) => {
                        total > best_total || (total == best_total && between > best_between)
                    }
                };
                if better {
                    best = Some((*a, *b, total, between));
                }
            }
        }
        best.map(|(a, b, _, _)| (a, b))
    }

    fn reunite(&self, orig_id: &str, parts: &[&CensusPolygon]) -> CensusPolygon {
        let mut record = parts[0].clone();
        record.geometry = unary_union(parts.iter().map(|p| &p.geometry));
        record.poly_id = pad_id(orig_id, self.options.id_length);
        record.orig_id = Some(orig_id.to_string());
        record.was_multipart = Some(true);
        record.comb_adj = Some(0);
        for column in &self.options.count_columns {
            record.set_value(column, parts.iter().map(|p| p.value(column)).sum());
        }
        record
    }

    fn absorb(
        &self,
        orig_id: &str,
        parts: &[&CensusPolygon],
        targets: &[&CensusPolygon],
        new_id: String,
    ) -> CensusPolygon {
        let pop_col = &self.options.population_column;
        let mut record = targets[0].clone();

        let mut geometry: MultiPolygon<f64> = unary_union(parts.iter().map(|p| &p.geometry));
        for target in targets {
            geometry = geometry.union(&target.geometry);
        }
        record.geometry = geometry;

        for column in &self.options.count_columns {
            let total = parts
                .iter()
                .chain(targets.iter())
                .map(|r| r.value(column))
                .sum();
            record.set_value(column, total);
        }

        // Parts carry the averages of the original multipart record
        let pop_parts: f64 = parts.iter().map(|p| p.value(pop_col)).sum();
        let pop_targets: f64 = targets.iter().map(|t| t.value(pop_col)).sum();
        let total_pop = pop_parts + pop_targets;
        for column in &self.options.numeric_columns {
            if self.options.count_columns.contains(column) {
                continue;
            }
            let parts_avg = parts[0].value(column);
            let value = if total_pop > 0.0 {
                let targets_avg = if pop_targets > 0.0 {
                    targets
                        .iter()
                        .map(|t| t.value(column) * t.value(pop_col))
                        .sum::<f64>()
                        / pop_targets
                } else {
                    parts_avg
                };
                parts_avg * (pop_parts / total_pop) + targets_avg * (pop_targets / total_pop)
            } else {
                parts_avg
            };
            record.set_value(column, value);
        }

        let merged_orig = std::iter::once(orig_id.to_string())
            .chain(
                targets
                    .iter()
                    .map(|t| t.orig_id.clone().unwrap_or_else(|| t.poly_id.clone())),
            )
            .collect::<Vec<_>>()
            .join("_");

        record.orig_id = Some(merged_orig);
        record.poly_id = new_id;
        record.was_multipart = Some(true);
        record.comb_adj = Some(targets.len() as i64);
        record
    }

    /// Fresh identifier from the group's base id plus a three digit suffix
    fn generate_id(&self, orig_id: &str, used: &mut HashSet<String>) -> String {
        let base = match orig_id.char_indices().rev().nth(1) {
            Some((cut, _)) if orig_id.len() > 2 => &orig_id[..cut],
            _ => orig_id,
        };
        let mut suffix = 1usize;
        loop {
            let candidate = pad_id(&format!("{}{:03}", base, suffix), self.options.id_length);
            if used.insert(candidate.clone()) {
                return candidate;
            }
            suffix += 1;
        }
    }
}

fn group_envelope(parts: &[&CensusPolygon]) -> Option<Rect<f64>> {
    parts
        .iter()
        .filter_map(|p| p.geometry.bounding_rect())
        .reduce(|a, b| {
            Rect::new(
                geo::coord! { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                geo::coord! { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
            )
        })
}
