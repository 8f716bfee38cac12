use super::{model_available, select_target_faces, BoundModel, FrameProcessor, RunContext};
use crate::config::ProcessorKind;
use morph_core::alignment::{paste_back, warp_face, ARCFACE_128_V2};
use morph_core::backend::first_output;
use morph_core::mask::box_mask;
use morph_core::models;
use morph_core::tensor::{frame_to_nchw, nchw_to_frame, ChannelOrder, Normalization};
use morph_core::{select_average, BackendError, Face, ModelBackend, Tensor};
use morph_media::{read_image, save_image, Frame};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SWAP_CROP_SIZE: usize = 128;
const EMBEDDING_DIM: usize = 512;
const EMAP_MODEL: &str = "inswapper_128_emap";

/// Replaces target faces with the source identity.
pub struct FaceSwapper {
    model: BoundModel,
    /// Identity projection for inswapper, `EMBEDDING_DIM²` row-major.
    emap: Option<Vec<f32>>,
    source_face: Option<Face>,
}

impl FaceSwapper {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            model: BoundModel::new(backend),
            emap: None,
            source_face: None,
        }
    }

    /// Composite identity of the source images, cached until `post_process`.
    fn source_face(&mut self, ctx: &RunContext<'_>, sources: &[PathBuf]) -> Option<Face> {
        if self.source_face.is_none() {
            let frames: Vec<Frame> = sources.iter().filter_map(|path| read_image(path)).collect();
            self.source_face = match select_average(ctx.analyser, &frames, &ctx.analyser_options()) {
                Ok(face) => face,
                Err(e) => {
                    tracing::warn!(error = %e, "source face detection failed");
                    None
                }
            };
        }
        self.source_face.clone()
    }

    fn source_tensor(&self, source: &Face) -> Tensor {
        let values = &source.embedding.values;
        let projected = match &self.emap {
            Some(emap) if values.len() == EMBEDDING_DIM => {
                let mut out = vec![0.0f32; EMBEDDING_DIM];
                for (i, v) in values.iter().enumerate() {
                    let row = &emap[i * EMBEDDING_DIM..(i + 1) * EMBEDDING_DIM];
                    for (acc, m) in out.iter_mut().zip(row) {
                        *acc += v * m;
                    }
                }
                out
            }
            _ => values.clone(),
        };
        let len = projected.len();
        Array2::from_shape_vec((1, len), projected)
            .map(|a| a.into_dyn())
            .unwrap_or_else(|_| Tensor::zeros(ndarray::IxDyn(&[1, len])))
    }

    /// Swap `target` in `frame` for `source`.
    fn swap(&self, ctx: &RunContext<'_>, frame: &mut Frame, source: &Face, target: &Face) -> Result<(), BackendError> {
        let handle = self
            .model
            .handle()
            .ok_or_else(|| BackendError::InferenceFailed("face swapper has no session".into()))?;

        let (crop, matrix) = warp_face(frame, &target.landmarks, &ARCFACE_128_V2, SWAP_CROP_SIZE);
        let target_tensor = frame_to_nchw(&crop, Normalization::uniform(0.0, 255.0), ChannelOrder::Rgb);
        let outputs = self
            .model
            .backend()
            .infer(handle, vec![target_tensor, self.source_tensor(source)])?;
        let output = first_output(outputs, handle)?;
        let swapped = nchw_to_frame(&output, ChannelOrder::Rgb, |v| v.clamp(0.0, 1.0) * 255.0)
            .ok_or_else(|| BackendError::InferenceFailed(format!("{handle}: unexpected output shape {:?}", output.shape())))?;

        let padding = ctx.config.padding().unwrap_or_default();
        let mask = box_mask(swapped.width as usize, swapped.height as usize, ctx.config.face_mask_blur, padding);
        paste_back(frame, &swapped, &mask, &matrix);
        Ok(())
    }

    fn load_emap(&mut self, ctx: &RunContext<'_>) {
        self.emap = None;
        if !ctx.config.face_swapper_model.starts_with("inswapper") {
            return;
        }
        let Ok(spec) = models::lookup(EMAP_MODEL) else {
            return;
        };
        let path = spec.path_in(&ctx.config.model_dir);
        let Ok(bytes) = std::fs::read(&path) else {
            tracing::debug!(path = %path.display(), "no embedding map, using raw embeddings");
            return;
        };
        if bytes.len() != EMBEDDING_DIM * EMBEDDING_DIM * 4 {
            tracing::warn!(path = %path.display(), bytes = bytes.len(), "embedding map has wrong size, ignored");
            return;
        }
        self.emap = Some(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        );
    }
}

impl FrameProcessor for FaceSwapper {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::FaceSwapper
    }

    fn pre_check(&mut self, ctx: &RunContext<'_>) -> bool {
        ctx.analyser.pre_check(&ctx.analyser_options())
            && model_available(&ctx.config.face_swapper_model, &ctx.config.model_dir, ctx.config.skip_download)
    }

    fn pre_process(&mut self, ctx: &RunContext<'_>) -> bool {
        if ctx.config.sources.is_empty() {
            tracing::warn!(stage = self.name(), "select a source image");
            return false;
        }
        if let Some(source) = ctx.config.sources.iter().find(|p| !morph_media::is_image(p)) {
            tracing::warn!(stage = self.name(), path = %source.display(), "source is not an image");
            return false;
        }
        true
    }

    fn post_models(&mut self, ctx: &RunContext<'_>) -> Result<(), BackendError> {
        let spec = models::lookup(&ctx.config.face_swapper_model)?;
        self.model.bind(spec, ctx.device)?;
        self.load_emap(ctx);
        Ok(())
    }

    fn process_image(&mut self, ctx: &RunContext<'_>, sources: &[PathBuf], input: &Path, output: &Path) -> bool {
        let Some(source) = self.source_face(ctx, sources) else {
            tracing::warn!(stage = self.name(), "no face in source images");
            return false;
        };
        let Some(mut frame) = read_image(input) else {
            tracing::warn!(stage = self.name(), path = %input.display(), "unreadable input");
            return false;
        };

        let targets = select_target_faces(ctx, &frame);
        if targets.is_empty() {
            tracing::warn!(stage = self.name(), mode = ?ctx.config.face_selector_mode, "no target face selected");
            return false;
        }

        for target in &targets {
            if let Err(e) = self.swap(ctx, &mut frame, &source, target) {
                tracing::warn!(stage = self.name(), error = %e, "swap failed");
                return false;
            }
        }
        tracing::debug!(stage = self.name(), faces = targets.len(), "faces swapped");

        match save_image(output, &frame, ctx.config.output_image_quality) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(stage = self.name(), path = %output.display(), error = %e, "write failed");
                false
            }
        }
    }

    fn post_process(&mut self) {
        self.source_face = None;
    }

    fn reference_frame(&mut self, ctx: &RunContext<'_>, reference: &Face, frame: &Frame) -> Option<Frame> {
        let source = self.source_face(ctx, &ctx.config.sources)?;
        let mut swapped = frame.clone();
        let result = self.swap(ctx, &mut swapped, &source, reference);
        self.source_face = None;
        match result {
            Ok(()) => Some(swapped),
            Err(e) => {
                tracing::warn!(stage = self.name(), error = %e, "reference swap failed");
                None
            }
        }
    }
}
