//! File retrieval
//!
//! Pulls a file or directory tree out of a running container by invoking
//! `tar cf -` remotely over a pipe session and unpacking the archive as it
//! streams back. Entry names are checked against the requested source path
//! so a hostile archive cannot write outside the destination.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, warn};

use crate::exec::{start_process, ExecError, PodStatus, PodTarget, RemoteExec};
use crate::terminal::{IoStreams, PipeSession};

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("filepath can not be empty")]
    EmptyPath,

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("tar contents corrupted")]
    CorruptArchive,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Copy `src` (a file or directory inside the container) into `dest` on the
/// local filesystem. The remote side produces a tar stream; unpacking runs
/// concurrently with the remote invocation so arbitrarily large trees never
/// buffer in memory.
pub async fn copy_from_pod(
    executor: Arc<dyn RemoteExec>,
    target: PodTarget,
    status: PodStatus,
    src: &str,
    dest: &Path,
) -> Result<(), CopyError> {
    if src.is_empty() {
        return Err(CopyError::EmptyPath);
    }

    let (read_end, write_end) = tokio::io::duplex(64 * 1024);
    let session = Arc::new(PipeSession::new(IoStreams {
        stdin: None,
        stdout: Some(Box::new(write_end)),
        stderr: None,
    }));

    let command = vec!["tar".to_string(), "cf".to_string(), "-".to_string(), src.to_string()];
    debug!(
        "copy from {}/{} container {}: {:?}",
        target.namespace, target.pod, target.container, command
    );

    // The session (and with it the write end of the pipe) moves into the
    // exec task; when the remote command finishes, dropping it closes the
    // stream and the unpacker sees EOF.
    let exec_task = tokio::spawn(start_process(executor, session, command, target, status));

    // Tar strips the leading slash, so entry names start at the first
    // path component of the source.
    let prefix = strip_path_shortcuts(src.trim_start_matches('/'));
    let dest = dest.to_path_buf();
    let unpacked = tokio::task::spawn_blocking(move || {
        untar_all(SyncIoBridge::new(read_end), &dest, &prefix)
    })
    .await?;

    // An exec failure also garbles the tar stream; report the root cause,
    // not the downstream parse error.
    if let Err(err) = exec_task.await? {
        warn!("remote tar invocation failed: {}", err);
        return Err(err.into());
    }

    unpacked
}

/// Resolve `.` and `..` components lexically, never escaping above the
/// start of the path. `"../../etc"` becomes `"etc"`.
fn strip_path_shortcuts(path: &str) -> PathBuf {
    let mut stripped = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => stripped.push(part),
            Component::ParentDir => {
                stripped.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    stripped
}

fn untar_all(reader: impl Read, dest: &Path, prefix: &Path) -> Result<(), CopyError> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.into_owned();
        let relative = match name.strip_prefix(prefix) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => return Err(CopyError::CorruptArchive),
        };
        // A prefix match is not enough: a crafted name like `a/../../x`
        // still survives it, so reject traversal components outright.
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(CopyError::CorruptArchive);
        }

        // A single-file copy strips down to an empty relative path; the
        // file keeps its base name under the destination.
        let out_path = if relative.as_os_str().is_empty() {
            match prefix.file_name() {
                Some(name) => dest.join(name),
                None => return Err(CopyError::CorruptArchive),
            }
        } else {
            dest.join(&relative)
        };
        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut file)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio_util::io::SyncIoBridge as BlockingBridge;

    use crate::exec::{ExecRequest, PodPhase, RemoteExec};
    use crate::terminal::PtyHandler;

    #[test]
    fn test_strip_path_shortcuts() {
        assert_eq!(strip_path_shortcuts("etc/hosts"), PathBuf::from("etc/hosts"));
        assert_eq!(strip_path_shortcuts("../../etc"), PathBuf::from("etc"));
        assert_eq!(strip_path_shortcuts("a/../b"), PathBuf::from("b"));
        assert_eq!(strip_path_shortcuts("a/./b"), PathBuf::from("a/b"));
        assert_eq!(strip_path_shortcuts(".."), PathBuf::new());
    }

    /// Writes a fixed tar stream to the handler's stdout, the way a remote
    /// `tar cf -` invocation would.
    struct TarExec {
        entries: Vec<(String, Vec<u8>)>,
    }

    #[async_trait]
    impl RemoteExec for TarExec {
        async fn stream(
            &self,
            _request: ExecRequest,
            handler: Arc<dyn PtyHandler>,
        ) -> anyhow::Result<()> {
            let mut builder = tar::Builder::new(Vec::new());
            for (name, content) in &self.entries {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, content.as_slice())?;
            }
            let archive = builder.into_inner()?;
            handler.write_stdout(&archive).await?;
            Ok(())
        }
    }

    fn running() -> PodStatus {
        PodStatus::new(PodPhase::Running, vec!["nginx".to_string()])
    }

    fn target() -> PodTarget {
        PodTarget::new("default", "nginx-65f9798fbf-jdrgl", "nginx")
    }

    #[tokio::test]
    async fn test_copy_single_file() {
        let executor = Arc::new(TarExec {
            entries: vec![("etc/hosts".to_string(), b"127.0.0.1 localhost\n".to_vec())],
        });
        let dest = tempfile::tempdir().unwrap();

        copy_from_pod(executor, target(), running(), "/etc/hosts", dest.path())
            .await
            .unwrap();

        let copied = std::fs::read_to_string(dest.path().join("hosts")).unwrap();
        assert_eq!(copied, "127.0.0.1 localhost\n");
    }

    #[tokio::test]
    async fn test_copy_directory_tree() {
        let executor = Arc::new(TarExec {
            entries: vec![
                ("var/log/app/a.log".to_string(), b"alpha".to_vec()),
                ("var/log/app/sub/b.log".to_string(), b"beta".to_vec()),
            ],
        });
        let dest = tempfile::tempdir().unwrap();

        copy_from_pod(executor, target(), running(), "/var/log/app", dest.path())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.path().join("a.log")).unwrap(),
            "alpha"
        );
        assert_eq!(
            std::fs::read_to_string(dest.path().join("sub/b.log")).unwrap(),
            "beta"
        );
    }

    #[tokio::test]
    async fn test_entry_outside_prefix_is_rejected() {
        let executor = Arc::new(TarExec {
            entries: vec![("somewhere/else".to_string(), b"nope".to_vec())],
        });
        let dest = tempfile::tempdir().unwrap();

        let err = copy_from_pod(executor, target(), running(), "/etc/hosts", dest.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::CorruptArchive));
    }

    #[tokio::test]
    async fn test_exec_failure_surfaces_root_cause() {
        let executor = Arc::new(TarExec {
            entries: vec![("etc/hosts".to_string(), b"127.0.0.1 localhost\n".to_vec())],
        });
        let dest = tempfile::tempdir().unwrap();

        // validation fails before tar runs, so only the error report lands
        // in the stream; the caller must see the exec error, not a parse
        // error from the garbled archive
        let status = PodStatus::new(PodPhase::Succeeded, vec!["nginx".to_string()]);
        let err = copy_from_pod(executor, target(), status, "/etc/hosts", dest.path())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CopyError::Exec(ExecError::CompletedPod(_))
        ));
        assert!(err.to_string().contains("completed pod"));
    }

    #[tokio::test]
    async fn test_remote_failure_surfaces_root_cause() {
        struct BrokenExec;

        #[async_trait]
        impl RemoteExec for BrokenExec {
            async fn stream(
                &self,
                _request: ExecRequest,
                _handler: Arc<dyn PtyHandler>,
            ) -> anyhow::Result<()> {
                anyhow::bail!("container runtime unavailable")
            }
        }

        let dest = tempfile::tempdir().unwrap();
        let err = copy_from_pod(
            Arc::new(BrokenExec),
            target(),
            running(),
            "/etc/hosts",
            dest.path(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CopyError::Exec(ExecError::Remote(_))));
        assert!(err.to_string().contains("container runtime unavailable"));
    }

    #[tokio::test]
    async fn test_empty_path_is_rejected() {
        let executor = Arc::new(TarExec { entries: vec![] });
        let dest = tempfile::tempdir().unwrap();

        let err = copy_from_pod(executor, target(), running(), "", dest.path())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "filepath can not be empty");
    }

    #[test]
    fn test_untar_rejects_traversal_inside_entry() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        // `append_data` refuses `..` components, so write the raw name
        // bytes into the header to get the traversal path on the wire.
        let name = b"etc/../../x";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &b"nope"[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let result = untar_all(archive.as_slice(), dest.path(), Path::new("etc"));
        assert!(matches!(result, Err(CopyError::CorruptArchive)));
    }

    // SyncIoBridge is only referenced through the async path above; keep a
    // direct check that the blocking unpack sees EOF when the writer drops.
    #[tokio::test]
    async fn test_unpack_finishes_on_writer_drop() {
        let (read_end, write_end) = tokio::io::duplex(1024);

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut builder = tar::Builder::new(Vec::new());
            let mut header = tar::Header::new_gnu();
            header.set_size(2);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "f/x", &b"ok"[..]).unwrap();
            let archive = builder.into_inner().unwrap();
            let mut write_end = write_end;
            write_end.write_all(&archive).await.unwrap();
            // write_end drops here; the reader must observe EOF
        });

        let dest = tempfile::tempdir().unwrap();
        let dest_path = dest.path().to_path_buf();
        let unpacked = tokio::task::spawn_blocking(move || {
            untar_all(BlockingBridge::new(read_end), &dest_path, Path::new("f"))
        })
        .await
        .unwrap();

        writer.await.unwrap();
        unpacked.unwrap();
        assert_eq!(std::fs::read_to_string(dest.path().join("x")).unwrap(), "ok");
    }
}
