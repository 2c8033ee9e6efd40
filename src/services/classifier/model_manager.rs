use crate::error::AppError;
use crate::services::classifier::inference::{self, ClipModel, PreprocessConfig};
use futures::StreamExt;
use ort::session::Session;
use std::path::{Path, PathBuf};

pub const MODEL_FILE: &str = "onnx/model.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const PREPROCESSOR_FILE: &str = "preprocessor_config.json";

const REQUIRED_FILES: [&str; 3] = [PREPROCESSOR_FILE, TOKENIZER_FILE, MODEL_FILE];

/// Locates, downloads and loads the files of one Hugging Face model repo.
#[derive(Clone, Debug)]
pub struct ModelManager {
    pub model_dir: PathBuf,
    pub model_id: String,
    base_url: String,
}

impl ModelManager {
    pub fn new(models_root: &Path, model_id: &str, base_url: &str) -> Self {
        let model_dir = models_root.join(model_id.replace('/', "__"));
        Self {
            model_dir,
            model_id: model_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn file_path(&self, file: &str) -> PathBuf {
        self.model_dir.join(file)
    }

    pub fn remote_url(&self, file: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base_url, self.model_id, file)
    }

    pub fn missing_files(&self) -> Vec<&'static str> {
        REQUIRED_FILES
            .into_iter()
            .filter(|file| !self.file_path(file).exists())
            .collect()
    }

    pub fn is_downloaded(&self) -> bool {
        self.missing_files().is_empty()
    }

    pub async fn download_model(&self) -> Result<(), AppError> {
        let missing = self.missing_files();
        if missing.is_empty() {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.model_dir)
            .await
            .map_err(|e| {
                AppError::Internal(format!(
                    "Failed to create model directory {}: {}",
                    self.model_dir.display(),
                    e
                ))
            })?;

        let client = reqwest::Client::new();
        for file in missing {
            let url = self.remote_url(file);
            tracing::info!("Downloading {} from {}", file, url);
            download_file(&client, &url, &self.file_path(file)).await?;
        }

        Ok(())
    }

    pub async fn load_model(&self, use_gpu: bool, intra_threads: usize) -> Result<ClipModel, AppError> {
        let missing = self.missing_files();
        if !missing.is_empty() {
            return Err(AppError::Internal(format!(
                "Model {} is missing files: {}",
                self.model_id,
                missing.join(", ")
            )));
        }

        let config_path = self.file_path(PREPROCESSOR_FILE);
        let config_content = tokio::fs::read_to_string(&config_path)
            .await
            .map_err(|e| {
                AppError::Internal(format!(
                    "Failed to read preprocessor config {}: {}",
                    config_path.display(),
                    e
                ))
            })?;
        let preprocess = PreprocessConfig::from_json(&config_content)?;

        let tokenizer_path = self.file_path(TOKENIZER_FILE);
        let model_path = self.file_path(MODEL_FILE);

        let model = tokio::task::spawn_blocking(move || -> Result<ClipModel, AppError> {
            let tokenizer = inference::load_tokenizer(&tokenizer_path)?;
            let session = build_session(&model_path, use_gpu, intra_threads)?;
            Ok(ClipModel::new(session, tokenizer, preprocess))
        })
        .await
        .map_err(|e| AppError::Internal(format!("Failed to spawn model loading task: {}", e)))??;

        tracing::info!(
            "Loaded model {} ({})",
            self.model_id,
            if use_gpu { "gpu" } else { "cpu" }
        );

        Ok(model)
    }
}

fn build_session(model_path: &Path, use_gpu: bool, intra_threads: usize) -> Result<Session, AppError> {
    let _ = ort::init().with_name("waste-classifier").commit();

    let mut builder = Session::builder()
        .map_err(|e| AppError::Internal(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
        .map_err(|e| AppError::Internal(format!("Failed to set optimization level: {}", e)))?
        .with_intra_threads(intra_threads)
        .map_err(|e| AppError::Internal(format!("Failed to set intra threads: {}", e)))?;

    if use_gpu {
        builder = builder
            .with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default().build(),
                ort::execution_providers::CoreMLExecutionProvider::default().build(),
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ])
            .map_err(|e| {
                AppError::Internal(format!("Failed to register GPU execution providers: {}", e))
            })?;
    } else {
        builder = builder
            .with_execution_providers([
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ])
            .map_err(|e| {
                AppError::Internal(format!("Failed to register CPU execution provider: {}", e))
            })?;
    }

    builder.commit_from_file(model_path).map_err(|e| {
        AppError::Internal(format!(
            "Failed to load ONNX model {}: {}",
            model_path.display(),
            e
        ))
    })
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

async fn download_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<(), AppError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let part = partial_path(dest);
    let result = stream_to_file(client, url, &part).await;
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e);
    }

    tokio::fs::rename(&part, dest).await.map_err(|e| {
        AppError::Internal(format!("Failed to move {} into place: {}", dest.display(), e))
    })
}

async fn stream_to_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<(), AppError> {
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        return Err(format!("Failed to download {}: HTTP {}", url, response.status()).into());
    }

    let total_size = response.content_length().unwrap_or(0);
    let mut downloaded: u64 = 0;

    let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
        AppError::Internal(format!("Failed to create file {}: {}", dest.display(), e))
    })?;

    let mut stream = response.bytes_stream();
    let mut last_logged = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        downloaded += chunk.len() as u64;
        tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to write to file: {}", e)))?;

        if total_size > 0 {
            let progress = (downloaded * 100) / total_size;
            if progress >= last_logged + 10 {
                tracing::info!("{}: {}%", url, progress);
                last_logged = progress;
            }
        }
    }
    tokio::io::AsyncWriteExt::flush(&mut file).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_paths_per_model() {
        let manager = ModelManager::new(
            Path::new("/models"),
            "Xenova/clip-vit-base-patch16",
            "https://huggingface.co/",
        );
        assert_eq!(
            manager.model_dir,
            PathBuf::from("/models/Xenova__clip-vit-base-patch16")
        );
        assert_eq!(
            manager.file_path(MODEL_FILE),
            PathBuf::from("/models/Xenova__clip-vit-base-patch16/onnx/model.onnx")
        );
        assert_eq!(
            manager.remote_url(TOKENIZER_FILE),
            "https://huggingface.co/Xenova/clip-vit-base-patch16/resolve/main/tokenizer.json"
        );
    }

    #[test]
    fn reports_missing_files() {
        let root = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(root.path(), "org/model", "https://example.invalid");
        assert_eq!(manager.missing_files().len(), 3);
        assert!(!manager.is_downloaded());

        std::fs::create_dir_all(manager.file_path("onnx")).unwrap();
        std::fs::write(manager.file_path(TOKENIZER_FILE), "{}").unwrap();
        std::fs::write(manager.file_path(PREPROCESSOR_FILE), "{}").unwrap();
        assert_eq!(manager.missing_files(), vec![MODEL_FILE]);

        std::fs::write(manager.file_path(MODEL_FILE), b"onnx").unwrap();
        assert!(manager.is_downloaded());
    }

    #[test]
    fn partial_download_sits_next_to_destination() {
        assert_eq!(
            partial_path(Path::new("/m/onnx/model.onnx")),
            PathBuf::from("/m/onnx/model.onnx.part")
        );
    }

    #[tokio::test]
    async fn load_fails_when_files_missing() {
        let root = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(root.path(), "org/model", "https://example.invalid");
        let err = manager.load_model(false, 1).await.err().unwrap();
        assert!(err.to_string().contains("missing files"));
    }

    #[tokio::test]
    async fn download_is_noop_when_complete() {
        let root = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(root.path(), "org/model", "https://example.invalid");
        std::fs::create_dir_all(manager.file_path("onnx")).unwrap();
        for file in REQUIRED_FILES {
            std::fs::write(manager.file_path(file), "x").unwrap();
        }
        manager.download_model().await.unwrap();
    }
}
