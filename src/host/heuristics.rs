//! Heuristics role of the sandboxed process.
//!
//! Every call into a heuristic runs on a [`Stopwatch`] bounded by what is
//! left of that heuristic's [`TimeBudget`], with the Warden naming it as the
//! subject. The processor time it used is charged to the budget and to its
//! statistics; a heuristic whose budget runs out fails with
//! [`ErrorCode::HeuristicTimeout`].
use super::budget::{
    pixel_work, TimeBudget, BUDGET_PER_FEATURE, BUDGET_PER_PIXEL, BUDGET_PER_SEQUENCE,
    FEATURES_PER_BATCH,
};
use super::CommandResult;
use crate::channel::Channel;
use crate::config::types::ErrorCode;
use crate::kernel::watchdog::Stopwatch;
use crate::plugin::{
    Coordinates, Heuristic, HeuristicStatistics, Image, PluginError, PluginResult, StatisticsEntry,
};
use crate::protocol::MessageKind;
use crate::rpc::wire::write_statistics;
use crate::warden::Warden;
use log::debug;
use std::time::Duration;

/// Statistics entry a call is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Initialization,
    Sequences,
    Images,
    Positions,
    Features,
}

impl Family {
    fn entry(self, statistics: &mut HeuristicStatistics) -> &mut StatisticsEntry {
        match self {
            Self::Initialization => &mut statistics.initialization,
            Self::Sequences => &mut statistics.sequences,
            Self::Images => &mut statistics.images,
            Self::Positions => &mut statistics.positions,
            Self::Features => &mut statistics.features,
        }
    }
}

/// One constructed heuristic and its accounting.
struct Tracked {
    heuristic: Box<dyn Heuristic>,
    budget: TimeBudget,
    statistics: HeuristicStatistics,
    /// View prepared until finished
    prepared: Option<u32>,
    roi_extent: u32,
}

impl Tracked {
    fn new(heuristic: Box<dyn Heuristic>) -> Self {
        Self {
            heuristic,
            budget: TimeBudget::default(),
            statistics: HeuristicStatistics::default(),
            prepared: None,
            roi_extent: 0,
        }
    }

    /// Charge `elapsed` to `family`. Fails once the budget is exhausted.
    fn charge(&mut self, index: u32, family: Family, elapsed: Duration, subevents: u32) -> PluginResult<()> {
        let entry = family.entry(&mut self.statistics);
        entry.total += elapsed;
        entry.events += 1;
        entry.subevents += subevents;

        if self.budget.spend(elapsed) {
            return Ok(());
        }
        Err(PluginError::new(
            ErrorCode::HeuristicTimeout,
            format!("heuristic {index} used up its time budget ({elapsed:?} in the last call)"),
        ))
    }

    /// Run `call` on the heuristic, timed and attributed to it.
    fn run<T>(
        &mut self,
        index: u32,
        family: Family,
        subevents: u32,
        call: impl FnOnce(&mut dyn Heuristic) -> T,
    ) -> PluginResult<T> {
        let warden = Warden::get();
        if let Some(warden) = warden {
            warden.set_subject(Some(index));
            warden.restart_peak();
        }

        let watch = Stopwatch::start(self.budget.deadline());
        let output = call(self.heuristic.as_mut());
        let elapsed = watch.stop();

        if let Some(warden) = warden {
            warden.set_subject(None);
            self.statistics.max_memory = self.statistics.max_memory.max(warden.context().peak);
        }
        self.charge(index, family, elapsed, subevents)?;
        Ok(output)
    }
}

pub struct HeuristicsHost {
    heuristics: Vec<Tracked>,
}

impl HeuristicsHost {
    pub fn new(heuristics: Vec<Box<dyn Heuristic>>) -> Self {
        Self {
            heuristics: heuristics.into_iter().map(Tracked::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.heuristics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heuristics.is_empty()
    }

    /// Charge the processor time each constructor used to its heuristic.
    pub fn charge_construction(&mut self, timings: &[Duration]) -> PluginResult<()> {
        for (index, (tracked, &elapsed)) in self.heuristics.iter_mut().zip(timings).enumerate() {
            tracked.charge(index as u32, Family::Initialization, elapsed, 0)?;
        }
        Ok(())
    }

    pub fn statistics(&self, index: u32) -> Option<&HeuristicStatistics> {
        self.heuristics.get(index as usize).map(|tracked| &tracked.statistics)
    }

    fn tracked(&mut self, index: u32) -> PluginResult<&mut Tracked> {
        let count = self.heuristics.len();
        self.heuristics.get_mut(index as usize).ok_or_else(|| {
            PluginError::new(
                ErrorCode::InvalidArguments,
                format!("heuristic index {index} out of range ({count} loaded)"),
            )
        })
    }

    pub(super) fn handle(&mut self, kind: MessageKind, channel: &mut Channel) -> Option<CommandResult> {
        let result = match kind {
            MessageKind::HeuristicSetSeed => self.set_seed(channel),
            MessageKind::HeuristicInit => self.init(channel),
            MessageKind::HeuristicDim => self.dim(channel),
            MessageKind::HeuristicPrepareForSequence => self.prepare_for_sequence(channel),
            MessageKind::HeuristicFinishForSequence => self.finish_for_sequence(channel),
            MessageKind::HeuristicPrepareForImage => self.prepare_for_image(channel),
            MessageKind::HeuristicFinishForImage => self.finish_for_image(channel),
            MessageKind::HeuristicPrepareForCoordinates => self.prepare_for_coordinates(channel),
            MessageKind::HeuristicFinishForCoordinates => self.finish_for_coordinates(channel),
            MessageKind::HeuristicComputeSomeFeatures => self.compute_some_features(channel),
            MessageKind::HeuristicReportStatistics => self.report_statistics(channel),
            _ => return None,
        };
        Some(result)
    }

    fn set_seed(&mut self, channel: &mut Channel) -> CommandResult {
        let index = channel.read::<u32>()?;
        let seed = channel.read::<u32>()?;
        self.tracked(index)?
            .run(index, Family::Initialization, 0, |heuristic| heuristic.set_seed(seed))?;
        respond(channel)
    }

    fn init(&mut self, channel: &mut Channel) -> CommandResult {
        let index = channel.read::<u32>()?;
        let nb_views = channel.read::<u32>()?;
        let roi_extent = channel.read::<u32>()?;
        let tracked = self.tracked(index)?;
        tracked.roi_extent = roi_extent;
        tracked.run(index, Family::Initialization, 0, |heuristic| {
            heuristic.init(nb_views, roi_extent)
        })??;
        respond(channel)
    }

    fn dim(&mut self, channel: &mut Channel) -> CommandResult {
        let index = channel.read::<u32>()?;
        let dim = self.tracked(index)?.heuristic.dim();
        channel.start_packet(MessageKind::Response).add(&dim);
        channel.send_packet()?;
        Ok(())
    }

    fn prepare_for_sequence(&mut self, channel: &mut Channel) -> CommandResult {
        let index = channel.read::<u32>()?;
        let tracked = self.tracked(index)?;
        tracked.budget.grant(BUDGET_PER_SEQUENCE, 1);
        tracked.run(index, Family::Sequences, 0, |heuristic| heuristic.prepare_for_sequence())??;
        respond(channel)
    }

    fn finish_for_sequence(&mut self, channel: &mut Channel) -> CommandResult {
        let index = channel.read::<u32>()?;
        self.tracked(index)?
            .run(index, Family::Sequences, 0, |heuristic| heuristic.finish_for_sequence())?;
        respond(channel)
    }

    fn prepare_for_image(&mut self, channel: &mut Channel) -> CommandResult {
        let index = channel.read::<u32>()?;
        let view = channel.read::<u32>()?;
        let width = channel.read::<u32>()?;
        let height = channel.read::<u32>()?;
        let pixels = channel.read_raw(Image::expected_len(width, height))?;
        let image = Image::new(width, height, pixels);

        let tracked = self.tracked(index)?;
        let area = width as u64 * height as u64;
        tracked.budget.grant(BUDGET_PER_PIXEL, pixel_work(area));
        let subevents = area.min(u32::MAX as u64) as u32;
        tracked.run(index, Family::Images, subevents, |heuristic| {
            heuristic.prepare_for_image(view, &image)
        })??;
        tracked.prepared = Some(view);
        respond(channel)
    }

    fn finish_for_image(&mut self, channel: &mut Channel) -> CommandResult {
        let index = channel.read::<u32>()?;
        let tracked = self.tracked(index)?;
        match tracked.prepared.take() {
            Some(view) => tracked.run(index, Family::Images, 0, |heuristic| {
                heuristic.finish_for_image(view)
            })?,
            None => debug!("heuristic {index} finished without a prepared image"),
        }
        respond(channel)
    }

    fn prepare_for_coordinates(&mut self, channel: &mut Channel) -> CommandResult {
        let index = channel.read::<u32>()?;
        let position = Coordinates::new(channel.read::<u32>()?, channel.read::<u32>()?);
        let tracked = self.tracked(index)?;
        let side = 2 * tracked.roi_extent as u64 + 1;
        tracked.budget.grant(BUDGET_PER_PIXEL, pixel_work(side * side));
        tracked.run(index, Family::Positions, 0, |heuristic| {
            heuristic.prepare_for_coordinates(position)
        })??;
        respond(channel)
    }

    fn finish_for_coordinates(&mut self, channel: &mut Channel) -> CommandResult {
        let index = channel.read::<u32>()?;
        self.tracked(index)?
            .run(index, Family::Positions, 0, |heuristic| heuristic.finish_for_coordinates())?;
        respond(channel)
    }

    /// Features are computed in batches; each batch earns its share of
    /// budget first and the trusted side hears a `KeepAlive` before it.
    fn compute_some_features(&mut self, channel: &mut Channel) -> CommandResult {
        let index = channel.read::<u32>()?;
        let position = Coordinates::new(channel.read::<u32>()?, channel.read::<u32>()?);
        let count = channel.read::<u32>()? as usize;
        let features = channel.read_u32_block(count)?;
        if features.is_empty() {
            return Err(PluginError::new(ErrorCode::InvalidArguments, "no feature index requested").into());
        }

        let tracked = self.tracked(index)?;
        let dim = tracked.heuristic.dim();
        if let Some(&feature) = features.iter().find(|&&feature| feature >= dim) {
            return Err(PluginError::new(
                ErrorCode::InvalidArguments,
                format!("feature {feature} out of range (dimension {dim})"),
            )
            .into());
        }

        let mut values = Vec::with_capacity(features.len());
        for batch in features.chunks(FEATURES_PER_BATCH) {
            channel.send_empty(MessageKind::KeepAlive)?;
            tracked.budget.grant(BUDGET_PER_FEATURE, batch.len() as u32);
            let computed = tracked.run(index, Family::Features, batch.len() as u32, |heuristic| {
                batch
                    .iter()
                    .map(|&feature| heuristic.compute_feature(position, feature))
                    .collect::<Vec<_>>()
            })?;

            if let Some(offset) = computed.iter().position(|value| value.is_nan()) {
                return Err(PluginError::new(
                    ErrorCode::FeatureNotANumber,
                    format!(
                        "heuristic {index}, feature {} at ({}, {})",
                        batch[offset], position.x, position.y
                    ),
                )
                .into());
            }
            values.extend(computed);
        }

        channel.start_packet(MessageKind::Response).add_f32_block(&values);
        channel.send_packet()?;
        Ok(())
    }

    fn report_statistics(&mut self, channel: &mut Channel) -> CommandResult {
        let index = channel.read::<u32>()?;
        let statistics = self.tracked(index)?.statistics;
        write_statistics(channel.start_packet(MessageKind::Response), &statistics);
        channel.send_packet()?;
        Ok(())
    }
}

fn respond(channel: &mut Channel) -> CommandResult {
    channel.send_empty(MessageKind::Response)?;
    Ok(())
}
