use crate::{
    CaptionModel,
    beam::{GenerationConfig, beam_search},
    lora::{AdapterError, LoraAdapter},
};
use candle_core::{D, DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{blip, blip_text};
use image::{DynamicImage, imageops::FilterType};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

pub const IMAGE_SIZE: usize = 384;
pub const MODEL_FILE: &str = "model.safetensors";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Token the BLIP text decoder starts generation from.
const DECODER_START_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;

const IMAGE_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const IMAGE_STD: [f32; 3] = [0.26862954, 0.261_302_6, 0.275_777_1];

#[derive(Debug, thiserror::Error)]
pub enum CaptionError {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("failed to load LoRA adapter: {0}")]
    Adapter(#[from] AdapterError),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("missing model file {}", .0.display())]
    MissingFile(PathBuf),
}

fn blip_base_config() -> blip::Config {
    let text_config = blip_text::Config {
        vocab_size: 30524,
        hidden_size: 768,
        encoder_hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 768,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        max_position_embeddings: 512,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-12,
        is_decoder: true,
    };
    let vision_config = blip::VisionConfig {
        hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 512,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        image_size: IMAGE_SIZE,
        patch_size: 16,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-5,
    };

    blip::Config {
        text_config,
        vision_config,
        projection_dim: 512,
        image_text_hidden_size: 256,
    }
}

/// BLIP base image captioner, optionally specialised by a merged LoRA adapter.
pub struct BlipCaptioner {
    model: blip::BlipForConditionalGeneration,
    tokenizer: Tokenizer,
    device: Device,
    generation: GenerationConfig,
}

impl BlipCaptioner {
    /// Loads `model.safetensors` and the tokenizer from `model_dir` and merges
    /// the adapter found in `adapter_dir`, if that directory exists.
    ///
    /// The tokenizer is looked up in `model_dir/processor` first, which is
    /// where fine-tuning runs save it, then in `model_dir` itself.
    pub fn load(model_dir: &Path, adapter_dir: Option<&Path>) -> Result<Self, CaptionError> {
        let model_path = existing(model_dir.join(MODEL_FILE))?;
        let tokenizer_path = existing(model_dir.join("processor").join(TOKENIZER_FILE))
            .or_else(|_| existing(model_dir.join(TOKENIZER_FILE)))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| CaptionError::Tokenizer(e.to_string()))?;

        let mut weights = candle_core::safetensors::load(&model_path, &Device::Cpu)?;
        log::debug!("Loaded {} base tensors from {}", weights.len(), model_path.display());

        match adapter_dir.filter(|dir| dir.is_dir()) {
            Some(dir) => {
                let adapter = LoraAdapter::load(dir)?;
                let merged = adapter.merge_into(&mut weights)?;
                log::info!("Merged {} LoRA modules from {}", merged, dir.display());
            }
            None => log::warn!("No LoRA adapter found, using the base model only"),
        }

        let device = select_device()?;
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = blip::BlipForConditionalGeneration::new(&blip_base_config(), vb)?;

        log::info!("BLIP captioner ready on {:?}", device);

        Ok(Self {
            model,
            tokenizer,
            device,
            generation: GenerationConfig {
                eos_token_id: SEP_TOKEN_ID,
                ..GenerationConfig::default()
            },
        })
    }
}

impl CaptionModel for BlipCaptioner {
    type Error = CaptionError;

    fn caption(&mut self, image: &DynamicImage) -> Result<String, Self::Error> {
        let pixel_values = preprocess(image, &Device::Cpu)?.to_device(&self.device)?;
        let image_embeds = pixel_values.unsqueeze(0)?.apply(self.model.vision_model())?;

        let device = &self.device;
        let model = &mut self.model;
        let tokens = beam_search(&[DECODER_START_TOKEN_ID], &self.generation, |prefix| {
            // the decoder caches keys and values, but each hypothesis has its
            // own history, so every call replays the full prefix
            model.text_decoder().reset_kv_cache();
            let input_ids = Tensor::new(prefix, device)?.unsqueeze(0)?;
            let logits = model.text_decoder().forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            candle_nn::ops::log_softmax(&logits, D::Minus1)?
                .to_dtype(DType::F32)?
                .to_vec1::<f32>()
        })?;

        let caption = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| CaptionError::Tokenizer(e.to_string()))?;

        let caption = caption.trim().to_string();
        log::info!("[BLIP caption] {}", caption);
        Ok(caption)
    }
}

/// Resizes to 384x384 and normalizes into a `(3, 384, 384)` f32 tensor.
pub fn preprocess(image: &DynamicImage, device: &Device) -> candle_core::Result<Tensor> {
    let size = IMAGE_SIZE as u32;
    let img = image
        .resize_exact(size, size, FilterType::CatmullRom)
        .to_rgb8();
    let data = img.into_raw();
    let data = Tensor::from_vec(data, (IMAGE_SIZE, IMAGE_SIZE, 3), device)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, device)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, device)?.reshape((3, 1, 1))?;
    (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)
}

fn select_device() -> candle_core::Result<Device> {
    if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)
    } else if candle_core::utils::metal_is_available() {
        Device::new_metal(0)
    } else {
        Ok(Device::Cpu)
    }
}

fn existing(path: PathBuf) -> Result<PathBuf, CaptionError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(CaptionError::MissingFile(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 3, Rgb([255, 0, 0])));
        let tensor = preprocess(&image, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[3, IMAGE_SIZE, IMAGE_SIZE]);

        let pixel = tensor.get(0).unwrap().get(10).unwrap().get(10).unwrap();
        let red = pixel.to_scalar::<f32>().unwrap();
        let expected = (1.0 - IMAGE_MEAN[0]) / IMAGE_STD[0];
        assert!((red - expected).abs() < 0.05, "{red} vs {expected}");

        let pixel = tensor.get(2).unwrap().get(0).unwrap().get(0).unwrap();
        let blue = pixel.to_scalar::<f32>().unwrap();
        let expected = -IMAGE_MEAN[2] / IMAGE_STD[2];
        assert!((blue - expected).abs() < 0.05, "{blue} vs {expected}");
    }

    #[test]
    fn test_load_reports_missing_weights() {
        let dir = std::env::temp_dir().join(format!("scene-voice-empty-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let err = BlipCaptioner::load(&dir, None).err().unwrap();
        assert!(matches!(err, CaptionError::MissingFile(ref p) if p.ends_with(MODEL_FILE)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_base_config_matches_checkpoint_layout() {
        let config = blip_base_config();
        assert_eq!(config.vision_config.image_size, IMAGE_SIZE);
        assert_eq!(config.text_config.vocab_size as u32, DECODER_START_TOKEN_ID + 2);
    }
}
