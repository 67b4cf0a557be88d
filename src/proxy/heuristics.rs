use super::{begin, CommandContext};
use crate::config::types::{ErrorCode, PluginKind, Result, SandboxConfiguration, SandboxError};
use crate::core::{SandboxController, SpawnMode};
use crate::plugin::{Coordinates, Dimensions, HeuristicStatistics, Image};
use crate::protocol::MessageKind;
use crate::rpc::wire::read_statistics;
use crate::rpc::ReverseCallTable;
use std::path::PathBuf;

/// What the heuristics were last told about the images, for context strings.
#[derive(Debug, Default, Clone, Copy)]
struct ViewContext {
    nb_views: u32,
    roi_extent: u32,
    image: Option<Dimensions>,
}

/// Heuristic plugins running in one sandboxed process.
///
/// Several heuristics can share the sandbox; each is addressed by the index
/// returned when it was loaded.
pub struct SandboxedHeuristics {
    controller: SandboxController,
    views: ViewContext,
}

impl SandboxedHeuristics {
    pub fn new(config: SandboxConfiguration) -> Self {
        Self {
            controller: SandboxController::new(PluginKind::Heuristics, config),
            views: ViewContext::default(),
        }
    }

    pub fn create_sandbox(&mut self, mode: SpawnMode) -> Result<()> {
        self.controller.create_sandbox(mode)
    }

    pub fn set_heuristics_folder(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.controller.set_plugins_folder(path)
    }

    pub fn load_heuristic(&mut self, name: &str) -> Result<u32> {
        begin(&mut self.controller, CommandContext::method("loading").parameter("Heuristic", name))?;
        self.controller.load_plugin(name)
    }

    /// Construct every loaded heuristic.
    pub fn create_heuristics(&mut self) -> Result<()> {
        let mut context = CommandContext::method("constructor");
        for name in self.controller.plugins() {
            context = context.parameter("Heuristic", name);
        }
        begin(&mut self.controller, context)?;
        self.controller.create_plugins()
    }

    pub fn set_seed(&mut self, index: u32, seed: u32) -> Result<()> {
        let context = self.method("setSeed", index).parameter("Seed", seed);
        self.send(context, MessageKind::HeuristicSetSeed, |writer| {
            writer.add(&index).add(&seed);
        })
    }

    pub fn init(&mut self, index: u32, nb_views: u32, roi_extent: u32) -> Result<()> {
        self.views.nb_views = nb_views;
        self.views.roi_extent = roi_extent;
        let context = self.method("init", index);
        self.send(context, MessageKind::HeuristicInit, |writer| {
            writer.add(&index).add(&nb_views).add(&roi_extent);
        })
    }

    /// Number of features the heuristic computes.
    pub fn dim(&mut self, index: u32) -> Result<u32> {
        let context = self.method("dim", index);
        self.send(context, MessageKind::HeuristicDim, |writer| {
            writer.add(&index);
        })?;
        self.controller.read::<u32>()
    }

    pub fn prepare_for_sequence(&mut self, index: u32) -> Result<()> {
        let context = self.method("prepareForSequence", index);
        self.send(context, MessageKind::HeuristicPrepareForSequence, |writer| {
            writer.add(&index);
        })
    }

    pub fn finish_for_sequence(&mut self, index: u32) -> Result<()> {
        let context = self.method("finishForSequence", index);
        self.send(context, MessageKind::HeuristicFinishForSequence, |writer| {
            writer.add(&index);
        })
    }

    pub fn prepare_for_image(&mut self, index: u32, view: u32, image: &Image) -> Result<()> {
        if image.pixels.len() != Image::expected_len(image.width, image.height) {
            return Err(SandboxError::application(
                ErrorCode::InvalidArguments,
                format!(
                    "{} bytes of pixels for a {}x{} image",
                    image.pixels.len(),
                    image.width,
                    image.height
                ),
            ));
        }
        self.views.image = Some(image.dimensions());
        let context = self.method("prepareForImage", index).parameter("View", view);
        self.send(context, MessageKind::HeuristicPrepareForImage, |writer| {
            writer
                .add(&index)
                .add(&view)
                .add(&image.width)
                .add(&image.height)
                .add_raw(&image.pixels);
        })
    }

    pub fn prepare_for_coordinates(&mut self, index: u32, position: Coordinates) -> Result<()> {
        let context = self
            .method("prepareForCoordinates", index)
            .parameter("Coordinates", format_args!("({}, {})", position.x, position.y));
        self.send(context, MessageKind::HeuristicPrepareForCoordinates, |writer| {
            writer.add(&index).add(&position.x).add(&position.y);
        })
    }

    pub fn finish_for_coordinates(&mut self, index: u32) -> Result<()> {
        let context = self.method("finishForCoordinates", index);
        self.send(context, MessageKind::HeuristicFinishForCoordinates, |writer| {
            writer.add(&index);
        })
    }

    /// Values of `features` around `position` of the prepared image, in order.
    pub fn compute_some_features(
        &mut self,
        index: u32,
        position: Coordinates,
        features: &[u32],
    ) -> Result<Vec<f32>> {
        let context = self
            .method("computeSomeFeatures", index)
            .parameter("Coordinates", format_args!("({}, {})", position.x, position.y))
            .parameter("Features", features.len());
        self.send(context, MessageKind::HeuristicComputeSomeFeatures, |writer| {
            writer
                .add(&index)
                .add(&position.x)
                .add(&position.y)
                .add(&(features.len() as u32))
                .add_u32_block(features);
        })?;
        self.controller.read_f32_block(features.len())
    }

    pub fn finish_for_image(&mut self, index: u32) -> Result<()> {
        let context = self.method("finishForImage", index);
        self.send(context, MessageKind::HeuristicFinishForImage, |writer| {
            writer.add(&index);
        })?;
        self.views.image = None;
        Ok(())
    }

    /// Processor time and memory the heuristic used so far.
    pub fn report_statistics(&mut self, index: u32) -> Result<HeuristicStatistics> {
        let context = self.method("reportStatistics", index);
        self.send(context, MessageKind::HeuristicReportStatistics, |writer| {
            writer.add(&index);
        })?;
        self.controller.read_with(read_statistics)
    }

    pub fn controller(&self) -> &SandboxController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut SandboxController {
        &mut self.controller
    }

    pub fn close(&mut self) -> Result<()> {
        self.controller.close_sandbox()
    }

    fn method(&self, name: &str, index: u32) -> CommandContext {
        let heuristic = self
            .controller
            .plugins()
            .get(index as usize)
            .map_or("?", String::as_str);
        let mut context = CommandContext::method(name)
            .parameter("Heuristic", format_args!("#{index} {heuristic}"))
            .parameter("Number of views", self.views.nb_views)
            .parameter("ROI extent", format_args!("{} pixels", self.views.roi_extent));
        if let Some(size) = self.views.image {
            context = context.parameter("Image size", format_args!("{}x{} pixels", size.width, size.height));
        }
        context
    }

    fn send(
        &mut self,
        context: CommandContext,
        kind: MessageKind,
        build: impl FnOnce(&mut crate::protocol::PacketWriter),
    ) -> Result<()> {
        begin(&mut self.controller, context)?;
        self.controller.request(kind, build, &mut ReverseCallTable::None)
    }
}
