//! Affine pre-alignment through an external program.
//!
//! The program is called the way 3dAllineate is: it reads the base and
//! source images from disk and writes the resampled source and, unless only
//! resampling, a twelve-number matrix file. Both land in a temporary
//! directory that is removed once they are read back.

use qwarp::volume::io::load_gray_volume;
use qwarp::{PreAlign, PreAligned, PreAligner, QwarpError, QwarpResult, Volume};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::transforms::parse_matrix;

/// Blur used for the final affine pass unless the extra options set one.
const DEFAULT_FINE_BLUR: &str = "4.44";

#[derive(Debug)]
pub struct CommandAligner {
    pub program: String,
    pub base_path: PathBuf,
    pub source_path: PathBuf,
}

impl CommandAligner {
    /// Arguments for one call writing to `out` and `matrix`.
    pub fn arguments(&self, opts: &PreAlign, out: &Path, matrix: &Path) -> Vec<String> {
        let path = |p: &Path| p.display().to_string();
        let mut args: Vec<String> = if opts.resample_only {
            vec![
                "-master".into(),
                path(&self.base_path),
                "-source".into(),
                path(&self.source_path),
                "-prefix".into(),
                path(out),
                "-final".into(),
                "wsinc5".into(),
                "-float".into(),
                "-quiet".into(),
                "-1Dparam_apply".into(),
                "1D: 12@0'".into(),
            ]
        } else {
            vec![
                "-base".into(),
                path(&self.base_path),
                "-source".into(),
                path(&self.source_path),
                "-prefix".into(),
                path(out),
                "-1Dmatrix_save".into(),
                path(matrix),
                "-cmass".into(),
                "-final".into(),
                "wsinc5".into(),
                "-float".into(),
                "-master".into(),
                "BASE".into(),
            ]
        };
        if !opts.resample_only {
            let extra: Vec<&str> = opts.extra_opts.split_whitespace().collect();
            if !extra.contains(&"-fineblur") {
                args.extend(["-fineblur".to_string(), DEFAULT_FINE_BLUR.to_string()]);
            }
            args.extend(extra.into_iter().map(str::to_string));
        }
        args
    }

    fn run(&self, work_dir: &Path, opts: &PreAlign) -> QwarpResult<PreAligned> {
        let out = work_dir.join("aligned.png");
        let matrix_path = work_dir.join("aligned.aff12.1D");
        let mut cmd = Command::new(&self.program);
        cmd.args(self.arguments(opts, &out, &matrix_path));
        tracing::info!(program = %self.program, "starting affine pre-alignment");
        tracing::debug!("command: {:?}", cmd);

        let output = cmd
            .output()
            .map_err(|e| failure(format!("cannot run '{}': {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        if !out.is_file() {
            return Err(failure(format!("missing output {}", out.display())));
        }
        let source = load_gray_volume(&out).map_err(|e| failure(e.to_string()))?;
        let matrix = if opts.resample_only {
            None
        } else {
            let text = fs::read_to_string(&matrix_path)
                .map_err(|e| failure(format!("missing matrix {}: {e}", matrix_path.display())))?;
            Some(parse_matrix(&text).map_err(failure)?)
        };
        Ok(PreAligned { source, matrix })
    }
}

fn failure(reason: String) -> QwarpError {
    QwarpError::PreAlign { reason }
}

impl PreAligner for CommandAligner {
    fn prealign(&self, _base: &Volume, _source: &Volume, opts: &PreAlign) -> QwarpResult<PreAligned> {
        let dir = tempfile::tempdir()
            .map_err(|e| failure(format!("cannot create a temporary directory: {e}")))?;
        self.run(dir.path(), opts)
    }
}
