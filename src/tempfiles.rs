use crate::util::{base_name, ensure_dir, extension};
use anyhow::Result;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile, TempPath};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TempFiles {
    dir: PathBuf,
}

impl TempFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn materialize(&self, name: &str, bytes: &[u8]) -> io::Result<TempPath> {
        let mut file = self.create(name)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(file.into_temp_path())
    }

    pub fn allocate(&self, name: &str) -> io::Result<TempPath> {
        Ok(self.create(name)?.into_temp_path())
    }

    fn create(&self, name: &str) -> io::Result<NamedTempFile> {
        let base = base_name(name);
        let ext = extension(name);
        let prefix = if base.is_empty() { "job-".to_string() } else { format!("{base}-") };
        let suffix = if ext.is_empty() { String::new() } else { format!(".{ext}") };
        Builder::new()
            .prefix(&prefix)
            .suffix(&suffix)
            .tempfile_in(&self.dir)
    }
}

#[derive(Debug)]
pub enum JobFiles {
    Caller { input: PathBuf, output: PathBuf },
    Owned { input: TempPath, output: TempPath },
}

impl JobFiles {
    pub fn input(&self) -> &Path {
        match self {
            JobFiles::Caller { input, .. } => input.as_path(),
            JobFiles::Owned { input, .. } => &**input,
        }
    }

    pub fn output(&self) -> &Path {
        match self {
            JobFiles::Caller { output, .. } => output.as_path(),
            JobFiles::Owned { output, .. } => &**output,
        }
    }

    pub fn owns_files(&self) -> bool {
        matches!(self, JobFiles::Owned { .. })
    }

    pub fn release(self) {
        match self {
            JobFiles::Caller { .. } => {}
            JobFiles::Owned { input, output } => {
                remove(input);
                remove(output);
            }
        }
    }
}

fn remove(path: TempPath) {
    let shown = path.display().to_string();
    match path.close() {
        Ok(()) => debug!("removed temp file {shown}"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove temp file {shown}: {e}"),
    }
}
