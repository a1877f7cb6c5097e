//! Reproducibility grading and payload retention.

use super::recorder::load_run;
use super::{Determinism, Landscape, LandscapeError, ReproducibilityGrade, Result, RunStatus};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Grades a run from the determinism classes of its nodes.
///
/// Only deterministic and seeded nodes (or none at all) give
/// [`ReproducibilityGrade::FullReproducible`]; anything else needs the
/// recorded payloads to replay.
#[must_use]
pub fn compute_grade<I>(determinisms: I) -> ReproducibilityGrade
where
    I: IntoIterator<Item = Determinism>,
{
    if determinisms.into_iter().all(|d| d.is_reproducible()) {
        ReproducibilityGrade::FullReproducible
    } else {
        ReproducibilityGrade::ReplayReproducible
    }
}

/// Result of purging a run's payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    /// Rows whose payloads were deleted.
    pub rows_purged: usize,
    /// Grade before the purge.
    pub grade_before: ReproducibilityGrade,
    /// Grade after the purge.
    pub grade_after: ReproducibilityGrade,
}

impl Landscape {
    /// The run's reproducibility grade.
    ///
    /// The grade is set when the run is finalized. A finalized run with no
    /// grade is corrupt.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] if the grade is NULL.
    pub fn get_reproducibility_grade(&self, run_id: &str) -> Result<ReproducibilityGrade> {
        let run = self.get_run(run_id)?;
        run.reproducibility_grade.ok_or_else(|| {
            LandscapeError::integrity(format!(
                "run {run_id} ({}) has no reproducibility grade",
                run.status
            ))
        })
    }

    /// Deletes every row payload of a finalized run and marks the rows
    /// purged. A REPLAY_REPRODUCIBLE run degrades to ATTRIBUTABLE_ONLY;
    /// other grades are unchanged. Purging twice is a no-op the second
    /// time.
    ///
    /// Payload keys shared with rows of other runs are kept.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::InvalidTransition`] for a running run and
    /// [`LandscapeError::Integrity`] if the run has no grade.
    pub fn purge_payloads(&self, run_id: &str) -> Result<PurgeReport> {
        let run = self.get_run(run_id)?;
        if run.status == RunStatus::Running {
            return Err(LandscapeError::InvalidTransition {
                entity: "run",
                id: run_id.to_string(),
                reason: "cannot purge a running run".to_string(),
            });
        }
        let grade_before = self.get_reproducibility_grade(run_id)?;

        let keys: Vec<(String, String, bool)> = {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT r.row_id, r.source_data_ref, EXISTS (\
                     SELECT 1 FROM rows o WHERE o.source_data_ref = r.source_data_ref \
                     AND o.run_id != r.run_id AND o.payload_purged = 0) \
                 FROM rows r WHERE r.run_id = ?1 AND r.payload_purged = 0 \
                 AND r.source_data_ref IS NOT NULL",
            )?;
            let keys = stmt
                .query_map([run_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            keys
        };

        for (_, key, shared) in &keys {
            if !*shared {
                self.payloads.delete(key)?;
            }
        }

        let grade_after = match grade_before {
            ReproducibilityGrade::ReplayReproducible => ReproducibilityGrade::AttributableOnly,
            other => other,
        };

        self.transaction(|tx| {
            for (row_id, _, _) in &keys {
                tx.execute(
                    "UPDATE rows SET payload_purged = 1 WHERE row_id = ?1",
                    [row_id],
                )?;
            }
            if grade_after != grade_before {
                let current = load_run(tx, run_id)?;
                if current.reproducibility_grade == Some(ReproducibilityGrade::ReplayReproducible) {
                    tx.execute(
                        "UPDATE runs SET reproducibility_grade = ?1 WHERE run_id = ?2",
                        params![grade_after, run_id],
                    )?;
                }
            }
            Ok(())
        })?;

        if grade_after == grade_before {
            info!(run_id, rows = keys.len(), "payloads purged");
        } else {
            warn!(
                run_id,
                rows = keys.len(),
                from = %grade_before,
                to = %grade_after,
                "payloads purged, reproducibility degraded"
            );
        }
        Ok(PurgeReport {
            rows_purged: keys.len(),
            grade_before,
            grade_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landscape::test_support::{row_and_token, seeded};
    use crate::landscape::{NodeRegistration, NodeType};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_compute_grade() {
        use Determinism::*;
        assert_eq!(compute_grade([]), ReproducibilityGrade::FullReproducible);
        assert_eq!(
            compute_grade([Deterministic, Seeded]),
            ReproducibilityGrade::FullReproducible
        );
        for other in [IoRead, IoWrite, ExternalCall, NonDeterministic] {
            assert_eq!(
                compute_grade([Deterministic, other]),
                ReproducibilityGrade::ReplayReproducible
            );
        }
    }

    #[test]
    fn test_purge_degrades_replay_once() {
        let (landscape, run) = seeded();
        landscape
            .register_node(
                &run.run_id,
                NodeRegistration::new("step1::llm", "llm", NodeType::Transform, Determinism::ExternalCall),
            )
            .unwrap();
        let (row, _) = row_and_token(&landscape, &run, 0);
        landscape.finalize_run(&run.run_id, RunStatus::Completed).unwrap();
        assert_eq!(
            landscape.get_reproducibility_grade(&run.run_id).unwrap(),
            ReproducibilityGrade::ReplayReproducible
        );

        let report = landscape.purge_payloads(&run.run_id).unwrap();
        assert_eq!(report.rows_purged, 1);
        assert_eq!(report.grade_after, ReproducibilityGrade::AttributableOnly);
        assert!(landscape.get_row(&row.row_id).unwrap().payload_purged);

        let second = landscape.purge_payloads(&run.run_id).unwrap();
        assert_eq!(second.rows_purged, 0);
        assert_eq!(second.grade_before, ReproducibilityGrade::AttributableOnly);
        assert_eq!(second.grade_after, ReproducibilityGrade::AttributableOnly);
    }

    #[test]
    fn test_purge_leaves_full_reproducible() {
        let (landscape, run) = seeded();
        row_and_token(&landscape, &run, 0);
        landscape.finalize_run(&run.run_id, RunStatus::Completed).unwrap();
        let report = landscape.purge_payloads(&run.run_id).unwrap();
        assert_eq!(report.rows_purged, 1);
        assert_eq!(report.grade_after, ReproducibilityGrade::FullReproducible);
    }

    #[test]
    fn test_null_grade_on_finalized_run_raises() {
        let (landscape, run) = seeded();
        landscape.finalize_run(&run.run_id, RunStatus::Completed).unwrap();
        landscape
            .execute_raw(&format!(
                "UPDATE runs SET reproducibility_grade = NULL WHERE run_id = '{}'",
                run.run_id
            ))
            .unwrap();
        assert!(landscape.get_reproducibility_grade(&run.run_id).unwrap_err().is_integrity());
        assert!(landscape.purge_payloads(&run.run_id).unwrap_err().is_integrity());
    }

    #[test]
    fn test_purge_running_rejected() {
        let (landscape, run) = seeded();
        assert!(matches!(
            landscape.purge_payloads(&run.run_id),
            Err(LandscapeError::InvalidTransition { .. })
        ));
    }
}
