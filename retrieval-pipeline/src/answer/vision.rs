use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ImageDetail, ImageUrlArgs,
    },
    Client,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{error::AppError, utils::config::AppConfig};
use image::ImageOutputFormat;
use tracing::{debug, info, instrument, warn};

/// Longest edge of images sent to the model.
const MAX_IMAGE_EDGE: u32 = 1024;
const MAX_IMAGES: usize = 4;

const SYSTEM_PROMPT: &str = "You answer questions about the user's own files, browsing history and screen captures. \
Use only the numbered context and the attached images. If they do not contain the answer, say so plainly. \
Mention which numbered item supports each claim.";

/// Produces an answer from a question, a text context and image evidence.
/// `None` means no answer could be produced.
#[async_trait]
pub trait VisionAnswerer: Send + Sync {
    async fn answer(&self, question: &str, context: &str, images: &[PathBuf]) -> Option<String>;
}

/// Chat-completion backed answerer for OpenAI-compatible endpoints.
pub struct OpenAiVisionAnswerer {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiVisionAnswerer {
    pub fn new(client: Client<OpenAIConfig>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// `None` when no API key is configured.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let api_key = config.openai_api_key.as_deref()?;
        let client = Client::with_config(
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(&config.openai_base_url),
        );
        Some(Self::new(client, &config.vision_model))
    }

    fn build_request(
        &self,
        question: &str,
        context: &str,
        image_urls: Vec<String>,
    ) -> Result<CreateChatCompletionRequest, AppError> {
        let mut parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(format!(
                    "Context:\n==================\n{context}\n\nQuestion:\n==================\n{question}"
                ))
                .build()?
                .into(),
        ];
        for url in image_urls {
            parts.push(
                ChatCompletionRequestMessageContentPartImageArgs::default()
                    .image_url(
                        ImageUrlArgs::default()
                            .url(url)
                            .detail(ImageDetail::Low)
                            .build()?,
                    )
                    .build()?
                    .into(),
            );
        }

        Ok(CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(SYSTEM_PROMPT).into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(parts)
                    .build()?
                    .into(),
            ])
            .build()?)
    }
}

/// Downscale and re-encode as JPEG, returned as a data URL.
pub async fn image_data_url(path: &Path) -> Result<String, AppError> {
    let bytes = tokio::fs::read(path).await?;
    let jpeg = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, AppError> {
        let decoded = image::load_from_memory(&bytes)?;
        let resized = if decoded.width() > MAX_IMAGE_EDGE || decoded.height() > MAX_IMAGE_EDGE {
            decoded.thumbnail(MAX_IMAGE_EDGE, MAX_IMAGE_EDGE)
        } else {
            decoded
        };
        let mut buffer = Cursor::new(Vec::new());
        resized
            .to_rgb8()
            .write_to(&mut buffer, ImageOutputFormat::Jpeg(85))?;
        Ok(buffer.into_inner())
    })
    .await??;

    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)))
}

#[async_trait]
impl VisionAnswerer for OpenAiVisionAnswerer {
    #[instrument(skip_all, fields(model = %self.model, images = images.len()))]
    async fn answer(&self, question: &str, context: &str, images: &[PathBuf]) -> Option<String> {
        let mut image_urls = Vec::new();
        for path in images.iter().take(MAX_IMAGES) {
            match image_data_url(path).await {
                Ok(url) => image_urls.push(url),
                Err(err) => warn!(path = %path.display(), error = %err, "Skipping image for vision answer"),
            }
        }
        if image_urls.is_empty() {
            debug!("No usable images for vision answer");
            return None;
        }

        let request = match self.build_request(question, context, image_urls) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Failed to build vision request");
                return None;
            }
        };

        match self.client.chat().create(request).await {
            Ok(response) => {
                let text = response
                    .choices
                    .first()
                    .and_then(|choice| choice.message.content.as_deref())
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
                    .map(ToOwned::to_owned);
                info!(answered = text.is_some(), "Vision answer finished");
                text
            }
            Err(err) => {
                warn!(error = %err, "Vision answer request failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    #[tokio::test]
    async fn data_url_is_downscaled_jpeg() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("wide.png");
        ImageBuffer::from_pixel(2048, 512, Rgb([10u8, 120, 200]))
            .save(&path)
            .expect("write png");

        let url = image_data_url(&path).await.expect("data url");
        let encoded = url
            .strip_prefix("data:image/jpeg;base64,")
            .expect("jpeg data url prefix");
        let decoded = image::load_from_memory(&STANDARD.decode(encoded).expect("base64"))
            .expect("decodes");
        assert_eq!(decoded.width(), MAX_IMAGE_EDGE);
        assert_eq!(decoded.height(), 256);
    }

    #[tokio::test]
    async fn unreadable_images_produce_no_answer() {
        let config = AppConfig {
            openai_api_key: Some("test-key".into()),
            openai_base_url: "http://127.0.0.1:9".into(),
            ..AppConfig::default()
        };
        let answerer = OpenAiVisionAnswerer::from_config(&config).expect("configured");
        let answer = answerer
            .answer(
                "what is in the photo?",
                "1. [src:file doc:x] File: missing.png",
                &[PathBuf::from("/nonexistent/missing.png")],
            )
            .await;
        assert!(answer.is_none());

        assert!(OpenAiVisionAnswerer::from_config(&AppConfig::default()).is_none());
    }

    #[test]
    fn request_carries_context_and_images() {
        let answerer = OpenAiVisionAnswerer::new(Client::new(), "gpt-4o-mini");
        let request = answerer
            .build_request(
                "what?",
                "1. [src:file doc:a] note",
                vec!["data:image/jpeg;base64,AAAA".into()],
            )
            .expect("request builds");
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.messages.len(), 2);
    }
}
