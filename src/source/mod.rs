//! Uniform URI-addressable byte source: local paths/globs and `s3://` /
//! `gs://` / `az://` object stores behind one small surface.
//!
//! Listing and opening remote objects goes through `object_store`, driven
//! from a single current-thread tokio runtime kept alive for the life of
//! the process — the rest of the pipeline stays synchronous. Local files
//! are opened directly through `std::fs` for true streaming; remote
//! objects are read fully into memory per file (an E2B batch file is
//! bounded in size, so this keeps the async/sync boundary simple — see
//! DESIGN.md).

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use once_cell::sync::Lazy;
use tracing::warn;

use crate::errors::SourceError;

#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub uri: String,
    pub size_bytes: u64,
}

static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime for object_store calls")
});

fn scheme_of(uri: &str) -> &str {
    uri.split_once("://").map(|(scheme, _)| scheme).unwrap_or("local")
}

fn strip_scheme(uri: &str) -> &str {
    uri.strip_prefix("local://").unwrap_or(uri)
}

pub fn list(source_uri: &str) -> Result<Vec<DiscoveredFile>, SourceError> {
    match scheme_of(source_uri) {
        "local" => list_local(strip_scheme(source_uri)),
        "s3" | "gs" | "az" => list_remote(source_uri),
        other => Err(SourceError::UnsupportedScheme(other.to_string())),
    }
}

pub fn open(uri: &str) -> Result<Box<dyn BufRead + Send>, SourceError> {
    match scheme_of(uri) {
        "local" => open_local(strip_scheme(uri)),
        "s3" | "gs" | "az" => open_remote(uri),
        other => Err(SourceError::UnsupportedScheme(other.to_string())),
    }
}

/// Copies bytes aside to `quarantine_uri/basename`. Used by the
/// orchestrator when a file fails to load so the original input is never
/// lost.
pub fn quarantine(quarantine_uri: &str, basename: &str, bytes: &[u8]) -> Result<(), SourceError> {
    match scheme_of(quarantine_uri) {
        "local" => {
            let dir = strip_scheme(quarantine_uri);
            std::fs::create_dir_all(dir).map_err(|e| SourceError::OpenFailed {
                path: PathBuf::from(dir),
                reason: e.to_string(),
            })?;
            let target = Path::new(dir).join(basename);
            std::fs::write(&target, bytes).map_err(|e| SourceError::OpenFailed {
                path: target,
                reason: e.to_string(),
            })
        }
        "s3" | "gs" | "az" => {
            let full_uri = format!("{}/{}", quarantine_uri.trim_end_matches('/'), basename);
            let (store, path) = remote_store_and_path(&full_uri)?;
            RUNTIME.block_on(async {
                store
                    .put(&path, bytes.to_vec().into())
                    .await
                    .map_err(|e| SourceError::OpenFailed {
                        path: PathBuf::from(full_uri.clone()),
                        reason: e.to_string(),
                    })
            })?;
            Ok(())
        }
        other => Err(SourceError::UnsupportedScheme(other.to_string())),
    }
}

fn list_local(path_or_glob: &str) -> Result<Vec<DiscoveredFile>, SourceError> {
    let path = Path::new(path_or_glob);

    if path.is_dir() {
        return expand_glob(&format!("{}/*.xml", path_or_glob.trim_end_matches('/')));
    }
    if path_or_glob.contains('*') || path_or_glob.contains('?') || path_or_glob.contains('[') {
        return expand_glob(path_or_glob);
    }

    let metadata = std::fs::metadata(path).map_err(|e| SourceError::OpenFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(vec![DiscoveredFile {
        uri: path_or_glob.to_string(),
        size_bytes: metadata.len(),
    }])
}

fn expand_glob(pattern: &str) -> Result<Vec<DiscoveredFile>, SourceError> {
    let mut files = Vec::new();
    let paths = glob::glob(pattern).map_err(|e| SourceError::Unavailable(e.to_string()))?;

    for entry in paths {
        match entry {
            Ok(path) => {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                files.push(DiscoveredFile {
                    uri: path.display().to_string(),
                    size_bytes: size,
                });
            }
            Err(err) => warn!(error = %err, "glob entry could not be read, skipping"),
        }
    }

    files.sort_by(|a, b| a.uri.cmp(&b.uri));
    Ok(files)
}

fn open_local(path: &str) -> Result<Box<dyn BufRead + Send>, SourceError> {
    let file = File::open(path).map_err(|e| SourceError::OpenFailed {
        path: PathBuf::from(path),
        reason: e.to_string(),
    })?;
    Ok(Box::new(BufReader::new(file)))
}

fn remote_store_and_path(uri: &str) -> Result<(Arc<dyn ObjectStore>, ObjectPath), SourceError> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| SourceError::UnsupportedScheme(uri.to_string()))?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));

    let store: Arc<dyn ObjectStore> = match scheme {
        "s3" => Arc::new(
            AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()
                .map_err(|e| SourceError::Unavailable(e.to_string()))?,
        ),
        "gs" => Arc::new(
            GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(bucket)
                .build()
                .map_err(|e| SourceError::Unavailable(e.to_string()))?,
        ),
        "az" => Arc::new(
            MicrosoftAzureBuilder::from_env()
                .with_container_name(bucket)
                .build()
                .map_err(|e| SourceError::Unavailable(e.to_string()))?,
        ),
        other => return Err(SourceError::UnsupportedScheme(other.to_string())),
    };

    Ok((store, ObjectPath::from(key)))
}

fn list_remote(uri: &str) -> Result<Vec<DiscoveredFile>, SourceError> {
    let (store, prefix) = remote_store_and_path(uri)?;
    let (scheme, rest) = uri.split_once("://").expect("scheme checked by caller");
    let bucket = rest.split_once('/').map(|(b, _)| b).unwrap_or(rest);

    RUNTIME.block_on(async move {
        let mut stream = store.list(Some(&prefix));
        let mut files = Vec::new();

        while let Some(meta) = stream
            .try_next()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?
        {
            if meta.location.as_ref().ends_with(".xml") {
                files.push(DiscoveredFile {
                    uri: format!("{scheme}://{bucket}/{}", meta.location),
                    size_bytes: meta.size as u64,
                });
            }
        }

        files.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(files)
    })
}

fn open_remote(uri: &str) -> Result<Box<dyn BufRead + Send>, SourceError> {
    let (store, path) = remote_store_and_path(uri)?;

    let bytes = RUNTIME.block_on(async {
        let result = store.get(&path).await.map_err(|e| SourceError::OpenFailed {
            path: PathBuf::from(uri),
            reason: e.to_string(),
        })?;
        result.bytes().await.map_err(|e| SourceError::OpenFailed {
            path: PathBuf::from(uri),
            reason: e.to_string(),
        })
    })?;

    Ok(Box::new(Cursor::new(bytes.to_vec())))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn lists_a_single_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.xml");
        std::fs::write(&path, b"<a/>").unwrap();

        let files = list(path.to_str().unwrap()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size_bytes, 4);
    }

    #[test]
    fn lists_xml_files_in_a_directory_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.xml"), b"<a/>").unwrap();
        std::fs::write(dir.path().join("a.xml"), b"<a/>").unwrap();
        std::fs::write(dir.path().join("ignore.txt"), b"nope").unwrap();

        let files = list(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].uri.ends_with("a.xml"));
        assert!(files[1].uri.ends_with("b.xml"));
    }

    #[test]
    fn open_reads_local_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.xml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"hello").unwrap();

        let mut reader = open(path.to_str().unwrap()).unwrap();
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut reader, &mut buf).unwrap();
        assert_eq!(buf, "hello");
    }

    #[test]
    fn missing_local_file_is_an_open_failure() {
        let err = list("/no/such/path/batch.xml").unwrap_err();
        assert!(matches!(err, SourceError::OpenFailed { .. }));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err = list("ftp://example.com/a.xml").unwrap_err();
        assert!(matches!(err, SourceError::UnsupportedScheme(_)));
    }
}
