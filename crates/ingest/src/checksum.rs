use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Checksum file written into every job directory, in `sha256sum` format
pub const CHECKSUM_FILE: &str = "checksum.sha256";

const BLOCK_SIZE: usize = 1 << 20;

/// Hex SHA-256 of a file, read in blocks on a blocking thread
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = File::open(&path)
            .with_context(|| format!("Failed to open for checksum: {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; BLOCK_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .with_context(|| format!("Failed to read for checksum: {}", path.display()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .context("Checksum task failed")?
}

/// Hash `input` and record the digest in `job_dir`
pub async fn write_checksum(input: &Path, job_dir: &Path) -> Result<String> {
    let digest = sha256_file(input).await?;
    let name = input.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let path = job_dir.join(CHECKSUM_FILE);
    fs::write(&path, format!("{}  {}\n", digest, name))
        .with_context(|| format!("Failed to write checksum: {}", path.display()))?;
    Ok(digest)
}
