//! File assembler - merges part files into the destination
//!
//! Parts are copied in range order into a temporary file next to the
//! destination, which is then renamed into place. Readers of the destination
//! path never see a half-written file.

use crate::engine::control::TransferControl;
use crate::error::EngineError;
use rangefetch_types::FileChunk;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Temporary file used while request `id` assembles `destination`.
///
/// The request id is part of the name, so the temporary file never lands on
/// another request's destination in the same directory.
pub fn temp_path(destination: &Path, id: Uuid) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| sanitize_file_name(&n.to_string_lossy()))
        .unwrap_or_else(|| "download".to_string());
    let dir = destination.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".{}.{}.tmp", name, id.simple()))
}

/// Removes the temporary file if assembly is dropped before it finishes
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Replace characters that are not safe in file names on common platforms
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Merge `chunks` into `destination`, returning the final file size.
///
/// On failure the temporary file is removed and the part files are left
/// alone so another attempt does not need to download them again. On success
/// the part files are deleted.
pub async fn assemble(
    id: Uuid,
    chunks: &[FileChunk],
    destination: &Path,
    control: &TransferControl,
) -> Result<u64, EngineError> {
    let mut ordered: Vec<&FileChunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.start);

    let temp = temp_path(destination, id);
    info!(
        "Assembling {} chunks of {} into {:?}",
        ordered.len(),
        id,
        destination
    );

    let guard = TempGuard::new(temp.clone());
    let result = write_temp(&ordered, &temp, control)
        .await
        .and_then(|size| control.check().map(|()| size));
    let size = match result {
        Ok(size) => size,
        Err(e) => {
            discard(&temp).await;
            guard.disarm();
            return Err(e);
        }
    };

    if let Err(e) = tokio::fs::rename(&temp, destination).await {
        error!("Failed to move {:?} to {:?}: {}", temp, destination, e);
        discard(&temp).await;
        guard.disarm();
        return Err(EngineError::Filesystem(e));
    }
    guard.disarm();

    for chunk in &ordered {
        if let Err(e) = tokio::fs::remove_file(&chunk.part_path).await {
            warn!("Failed to remove part file {:?}: {}", chunk.part_path, e);
        }
    }

    info!("Assembled {:?} ({} bytes)", destination, size);
    Ok(size)
}

async fn write_temp(
    chunks: &[&FileChunk],
    temp: &Path,
    control: &TransferControl,
) -> Result<u64, EngineError> {
    // Verify every part before touching the destination directory
    for chunk in chunks {
        let metadata = match tokio::fs::metadata(&chunk.part_path).await {
            Ok(m) => m,
            Err(e) => {
                error!("Part file missing: {:?}", chunk.part_path);
                return Err(EngineError::Filesystem(e));
            }
        };
        if let Some(len) = chunk.len() {
            if metadata.len() != len {
                return Err(EngineError::RangeMismatch(format!(
                    "part file for chunk {} holds {} bytes, expected {}",
                    chunk.index,
                    metadata.len(),
                    len
                )));
            }
        }
    }

    if let Some(parent) = temp.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(temp)
        .await?;

    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;

    for chunk in chunks {
        control.check()?;
        debug!("Copying chunk {} from {:?}", chunk.index, chunk.part_path);

        let mut input = File::open(&chunk.part_path).await?;
        loop {
            let n = input.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            control.check()?;
            output.write_all(&buffer[..n]).await?;
            total += n as u64;
        }
    }

    output.flush().await?;
    output.sync_all().await?;
    Ok(total)
}

async fn discard(temp: &Path) {
    match tokio::fs::remove_file(temp).await {
        Ok(()) => debug!("Removed temporary file {:?}", temp),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove temporary file {:?}: {}", temp, e),
    }
}
