//! Round result export.
//!
//! Writes one JSON document and one CSV per finished round under the
//! configured directory. Failures are the caller's to log; they never touch
//! game state.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::state::FightResults;

#[derive(Clone)]
pub struct ResultExporter {
    dir: PathBuf,
}

impl ResultExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write `bossfight_<coin>_<roundId>_<wallclockMs>.json` and `.csv`.
    /// Returns both paths.
    pub fn export(&self, results: &FightResults) -> anyhow::Result<(PathBuf, PathBuf)> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating export dir {}", self.dir.display()))?;
        let base = format!(
            "bossfight_{}_{}_{}",
            results.coin,
            results.round_id,
            crate::now_ms()
        );

        let json_path = self.dir.join(format!("{base}.json"));
        let csv_path = self.dir.join(format!("{base}.csv"));

        self.write_json(&json_path, results)?;
        self.write_csv(&csv_path, results)?;
        Ok((json_path, csv_path))
    }

    fn write_json(&self, path: &Path, results: &FightResults) -> anyhow::Result<()> {
        let file =
            File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(file, results)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    fn write_csv(&self, path: &Path, results: &FightResults) -> anyhow::Result<()> {
        let mut writer =
            csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
        writer.write_record(["username", "hits"])?;
        // highest hitters first, name as tiebreak
        let mut rows: Vec<(&String, &u32)> = results.user_hits.iter().collect();
        rows.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (username, hits) in rows {
            let hits = hits.to_string();
            writer.write_record([username.as_str(), hits.as_str()])?;
        }
        writer.flush()?;
        Ok(())
    }
}
