use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use dialoguer::Confirm;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::http::ApiClient;
use crate::ui::{byte_bar, is_interactive, print_command_status, with_spinner, CommandStatus};
use crate::utils::format_bytes;

use super::api::{self, FileId, FileRecord, ScanStatus};

pub async fn run(
    client: &ApiClient,
    id: &str,
    output: Option<PathBuf>,
    force: bool,
    json: bool,
) -> Result<()> {
    let id = id.trim();
    if id.is_empty() {
        bail!("file id must not be empty");
    }
    let id = FileId::new(id);

    let record = with_spinner("Checking scan status...", json, api::get_file(client, &id)).await?;
    ensure_downloadable(&record)?;

    let target = output.unwrap_or_else(|| PathBuf::from(local_file_name(&record)));
    if target.exists() && !force {
        if !is_interactive() {
            bail!(
                "{} already exists. Use --force to overwrite it",
                target.display()
            );
        }
        let confirm = Confirm::new()
            .with_prompt(format!("Overwrite {}?", target.display()))
            .default(false)
            .interact()?;
        if !confirm {
            return Ok(());
        }
    }

    let (bytes, digest) = fetch_to(client, &record, &target, json).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string(&json!({
                "id": record.id,
                "path": target.display().to_string(),
                "bytes": bytes,
                "sha256": digest,
            }))?
        );
    } else {
        print_command_status(
            CommandStatus::Success,
            &format!(
                "Downloaded {} to {} ({})",
                record.display_name(),
                target.display(),
                format_bytes(bytes)
            ),
        );
    }
    Ok(())
}

/// Only files that finished scanning clean are served.
fn ensure_downloadable(record: &FileRecord) -> Result<()> {
    match record.scan_status {
        ScanStatus::Clean => Ok(()),
        ScanStatus::Pending | ScanStatus::Scanning => bail!(
            "file {} is still {}; wait for the scan to finish",
            record.id,
            record.scan_status
        ),
        status => bail!("file {} is {status} and cannot be downloaded", record.id),
    }
}

/// Stream the body into `<target>.part`, hashing as it goes, then move it
/// into place once the checksum (when known) matches.
async fn fetch_to(
    client: &ApiClient,
    record: &FileRecord,
    target: &Path,
    quiet: bool,
) -> Result<(u64, String)> {
    let response = api::download_file(client, &record.id).await?;
    let total = response.content_length().or(record.filesize).unwrap_or(0);
    let bar = byte_bar(total, record.display_name(), quiet);

    let partial = partial_path(target);
    let written = write_partial(response.bytes_stream(), &partial, |n| bar.set_position(n)).await;
    bar.finish_and_clear();
    let (written, digest) = written?;
    if let Some(expected) = expected_sha256(record) {
        if expected != digest {
            let _ = tokio::fs::remove_file(&partial).await;
            bail!("checksum mismatch for file {}: expected {expected}, got {digest}", record.id);
        }
        debug!(id = %record.id, "checksum verified");
    }

    tokio::fs::rename(&partial, target)
        .await
        .with_context(|| format!("could not move download to {}", target.display()))?;
    Ok((written, digest))
}

/// Write the body to `partial`, returning the byte count and SHA-256. On any
/// failure the partial file is removed before the error is returned.
async fn write_partial<S, B, E>(
    body: S,
    partial: &Path,
    on_progress: impl FnMut(u64),
) -> Result<(u64, String)>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let result = async {
        let mut file = tokio::fs::File::create(partial)
            .await
            .with_context(|| format!("could not create {}", partial.display()))?;
        let copied = copy_hashed(body, &mut file, on_progress)
            .await
            .with_context(|| format!("could not write {}", partial.display()))?;
        file.flush().await?;
        Ok(copied)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(partial).await;
    }
    result
}

async fn copy_hashed<S, B, E, W>(
    mut body: S,
    out: &mut W,
    mut on_progress: impl FnMut(u64),
) -> Result<(u64, String)>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
    W: AsyncWrite + Unpin,
{
    let mut hasher = Sha256::new();
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("download interrupted")?;
        let bytes = chunk.as_ref();
        hasher.update(bytes);
        out.write_all(bytes).await?;
        written += bytes.len() as u64;
        on_progress(written);
    }
    Ok((written, hex_digest(hasher)))
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// The record's checksum, when it looks like a SHA-256 hex digest.
fn expected_sha256(record: &FileRecord) -> Option<String> {
    let checksum = record.checksum.as_deref()?.trim();
    (checksum.len() == 64 && checksum.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| checksum.to_ascii_lowercase())
}

/// Stored name without any directory part, so a hostile name cannot escape
/// the working directory.
fn local_file_name(record: &FileRecord) -> String {
    record
        .filename
        .as_deref()
        .and_then(|name| Path::new(name).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty() && name != "..")
        .unwrap_or_else(|| format!("file-{}", record.id))
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{self, Poll};

    use futures_util::stream;

    use super::*;

    fn record(status: ScanStatus) -> FileRecord {
        FileRecord {
            filename: Some("report.pdf".into()),
            ..FileRecord::partial(FileId::new("7"), status)
        }
    }

    #[test]
    fn only_clean_files_download() {
        assert!(ensure_downloadable(&record(ScanStatus::Clean)).is_ok());
        for status in [
            ScanStatus::Pending,
            ScanStatus::Scanning,
            ScanStatus::Infected,
            ScanStatus::Quarantined,
        ] {
            assert!(ensure_downloadable(&record(status)).is_err(), "{status}");
        }
    }

    #[test]
    fn sha256_checksums_are_recognised() {
        let mut file = record(ScanStatus::Clean);
        file.checksum = Some("abc".into());
        assert_eq!(expected_sha256(&file), None);

        let digest = "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855";
        file.checksum = Some(digest.into());
        assert_eq!(expected_sha256(&file), Some(digest.to_ascii_lowercase()));
    }

    #[test]
    fn empty_input_hashes_to_known_digest() {
        assert_eq!(
            hex_digest(Sha256::new()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn local_name_drops_directories() {
        let mut file = record(ScanStatus::Clean);
        file.filename = Some("../../etc/passwd".into());
        assert_eq!(local_file_name(&file), "passwd");
        file.filename = None;
        assert_eq!(local_file_name(&file), "file-7");
    }

    struct BrokenDisk;

    impl AsyncWrite for BrokenDisk {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut task::Context<'_>,
            _: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::other("no space left on device")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut task::Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _: &mut task::Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn body(
        chunks: Vec<Result<&'static [u8], std::io::Error>>,
    ) -> impl Stream<Item = Result<&'static [u8], std::io::Error>> + Unpin {
        stream::iter(chunks)
    }

    #[tokio::test]
    async fn body_is_written_and_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("out.bin.part");
        let mut seen = Vec::new();

        let (bytes, digest) = write_partial(body(vec![Ok(&b"ab"[..]), Ok(&b"c"[..])]), &partial, |n| {
            seen.push(n)
        })
        .await
        .unwrap();

        assert_eq!(bytes, 3);
        assert_eq!(seen, vec![2, 3]);
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(std::fs::read(&partial).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn interrupted_body_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("out.bin.part");

        let err = write_partial(
            body(vec![Ok(&b"abc"[..]), Err(std::io::Error::other("connection reset"))]),
            &partial,
            |_| {},
        )
        .await
        .unwrap_err();

        assert!(format!("{err:#}").contains("download interrupted"));
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn write_error_stops_the_copy() {
        let mut progress = Vec::new();
        let err = copy_hashed(
            body(vec![Ok(&b"abc"[..]), Ok(&b"def"[..])]),
            &mut BrokenDisk,
            |n| progress.push(n),
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("no space left"));
        assert!(progress.is_empty());
    }

    #[test]
    fn partial_file_sits_next_to_target() {
        assert_eq!(
            partial_path(Path::new("out/report.pdf")),
            PathBuf::from("out/report.pdf.part")
        );
    }
}
