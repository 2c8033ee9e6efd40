use crate::error::AppError;
use crate::models::classify_types::{ClassifyResponse, WasteType};
use crate::services::classifier;
use crate::AppState;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use image::DynamicImage;

/// Largest accepted upload, measured on the raw file bytes.
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;
/// Multipart field carrying the image.
pub const FILE_FIELD: &str = "file";

struct Upload {
    file_name: Option<String>,
    bytes: Vec<u8>,
}

pub async fn classify_waste(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ClassifyResponse>, AppError> {
    let result = classify_upload(state, multipart).await;
    if let Err(e) = &result {
        match e {
            AppError::Internal(msg) => tracing::error!("Unexpected error: {}", msg),
            // Logged with its cause in `decode_image`
            AppError::InvalidImage => {}
            other => tracing::error!("Rejected upload: {}", other),
        }
    }
    result.map(Json)
}

async fn classify_upload(state: AppState, mut multipart: Multipart) -> Result<ClassifyResponse, AppError> {
    let Upload { file_name, bytes } = read_upload(&mut multipart, MAX_FILE_SIZE).await?;

    let model = state.model.clone();
    let span = tracing::Span::current();
    let classification = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        let image = decode_image(&bytes)?;
        classifier::classify(model.as_ref(), &image, &WasteType::labels())
    })
    .await??;

    let waste_type = WasteType::ALL
        .get(classification.index)
        .copied()
        .ok_or_else(|| {
            AppError::Internal(format!("Label index {} out of range", classification.index))
        })?;

    tracing::info!(
        "Classification result for {}: {}, Confidence: {}",
        file_name.as_deref().unwrap_or("<unnamed>"),
        waste_type,
        classification.confidence
    );

    Ok(ClassifyResponse {
        waste_type,
        confidence: classification.confidence,
    })
}

async fn read_upload(multipart: &mut Multipart, max_size: usize) -> Result<Upload, AppError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let upload_name = field.file_name().map(str::to_owned);
        let content_type = field.content_type().map(str::to_owned);
        tracing::info!(
            "Received file: {}, content type: {}",
            upload_name.as_deref().unwrap_or("<unnamed>"),
            content_type.as_deref().unwrap_or("<unknown>")
        );

        let mut bytes = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            if bytes.len() + chunk.len() > max_size {
                return Err(AppError::PayloadTooLarge);
            }
            bytes.extend_from_slice(&chunk);
        }

        return Ok(Upload {
            file_name: upload_name,
            bytes,
        });
    }

    Err(AppError::MissingFile)
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge
    } else {
        AppError::BadRequest(err.body_text())
    }
}

/// Decodes with the format sniffed from the bytes; the declared content type is ignored.
fn decode_image(bytes: &[u8]) -> Result<DynamicImage, AppError> {
    let image = image::load_from_memory(bytes).map_err(|e| {
        tracing::error!("Image processing error: {}", e);
        AppError::InvalidImage
    })?;

    if image.width() == 0 || image.height() == 0 {
        tracing::error!("Image processing error: image has no pixels");
        return Err(AppError::InvalidImage);
    }

    Ok(image)
}
