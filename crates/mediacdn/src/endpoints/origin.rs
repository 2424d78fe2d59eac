use std::io;
use std::path::Path as FsPath;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::PathRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use mediacdn_service::sniff::sniff_file;
use mediacdn_service::types::{ObjectKey, validate_component};
use tokio_util::io::ReaderStream;

use super::responder::{self, Disposition};
use super::{OriginState, ResponseError};

type Listing = (StatusCode, Json<Vec<String>>);

#[derive(Clone, Copy)]
enum EntryKind {
    Dir,
    File,
}

/// Lists the names of all entries of `kind` directly inside `dir`, sorted.
///
/// Symlinks are followed. Names that are not valid UTF-8 are skipped.
async fn list_entries(dir: &FsPath, kind: EntryKind) -> io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let Ok(metadata) = tokio::fs::metadata(entry.path()).await else {
            continue;
        };
        let wanted = match kind {
            EntryKind::Dir => metadata.is_dir(),
            EntryKind::File => metadata.is_file(),
        };
        if !wanted {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }

    names.sort();
    Ok(names)
}

fn listing(result: io::Result<Vec<String>>, dir: &FsPath, missing: StatusCode) -> Listing {
    match result {
        Ok(names) => (StatusCode::OK, Json(names)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => (missing, Json(vec![])),
        Err(err) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Error listing directory {}",
                dir.display()
            );
            (StatusCode::INTERNAL_SERVER_ERROR, Json(vec![]))
        }
    }
}

pub async fn list_series(State(state): State<OriginState>) -> Listing {
    let dir = state.content_dir.as_path();
    // an absent content dir simply serves nothing
    listing(list_entries(dir, EntryKind::Dir).await, dir, StatusCode::OK)
}

pub async fn list_types(
    State(state): State<OriginState>,
    path: Result<Path<String>, PathRejection>,
) -> Listing {
    let Ok(Path(series)) = path else {
        return (StatusCode::BAD_REQUEST, Json(vec![]));
    };
    if validate_component(&series, "series").is_err() {
        return (StatusCode::BAD_REQUEST, Json(vec![]));
    }

    let dir = state.content_dir.join(&series);
    let result = list_entries(&dir, EntryKind::Dir).await;
    listing(result, &dir, StatusCode::NOT_FOUND)
}

pub async fn list_files(
    State(state): State<OriginState>,
    path: Result<Path<(String, String)>, PathRejection>,
) -> Listing {
    let Ok(Path((series, ty))) = path else {
        return (StatusCode::BAD_REQUEST, Json(vec![]));
    };
    if validate_component(&series, "series").is_err() || validate_component(&ty, "type").is_err()
    {
        return (StatusCode::BAD_REQUEST, Json(vec![]));
    }

    let dir = state.content_dir.join(&series).join(&ty);
    tracing::debug!("Checking directory: {}", dir.display());
    let result = list_entries(&dir, EntryKind::File).await;
    listing(result, &dir, StatusCode::NOT_FOUND)
}

pub async fn get_file(
    State(state): State<OriginState>,
    path: Result<Path<(String, String, String)>, PathRejection>,
) -> Result<Response, ResponseError> {
    let Path((series, ty, filename)) = path?;
    let key = ObjectKey::new(series, ty, filename)?;
    let path = key.path_in(&state.content_dir);

    let opened = match tokio::fs::File::open(&path).await {
        Ok(file) => file.metadata().await.map(|metadata| (file, metadata)),
        Err(err) => Err(err),
    };
    let (mut file, metadata) = match opened {
        Ok((file, metadata)) if metadata.is_file() => (file, metadata),
        Ok(_) => return Err((StatusCode::NOT_FOUND, "File not found").into()),
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "File not found or not readable: {}",
                path.display()
            );
            return Err((StatusCode::NOT_FOUND, "File not found").into());
        }
    };

    let content_type = match sniff_file(&mut file, key.filename()).await {
        Ok(content_type) => content_type,
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "Unable to detect media type for: {}",
                key
            );
            return Err((StatusCode::BAD_REQUEST, "Unable to detect media type").into());
        }
    };
    let last_modified = metadata.modified()?;

    tracing::info!(%key, %content_type, "Streaming file");
    responder::file_response(
        Body::from_stream(ReaderStream::new(file)),
        metadata.len(),
        &content_type,
        Disposition::Inline,
        key.filename(),
        last_modified,
        state.max_age,
    )
}
