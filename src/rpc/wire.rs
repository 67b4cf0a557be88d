//! Field layouts of plugin values shared by forward commands and reverse calls.
use crate::channel::{Channel, ChannelError};
use crate::plugin::{
    ClassificationDone, ClassificationError, ClassifierFeatures, Coordinates, FeatureRef,
    HeuristicStatistics, LabelScore, Parameter, PlannerFeatures, StatisticsEntry,
};
use crate::protocol::{PacketError, PacketWriter};
use std::time::Duration;

/// `u32` count, then per parameter: name, `u32` argument count, arguments.
pub fn write_parameters(writer: &mut PacketWriter, parameters: &[Parameter]) {
    writer.add(&(parameters.len() as u32));
    for parameter in parameters {
        writer.add(&parameter.name).add(&(parameter.arguments.len() as u32));
        for argument in &parameter.arguments {
            writer.add(argument);
        }
    }
}

pub fn read_parameters(channel: &mut Channel) -> Result<Vec<Parameter>, ChannelError> {
    let count = channel.read::<u32>()?;
    let mut parameters = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let name = channel.read::<String>()?;
        let nb_arguments = channel.read::<u32>()?;
        let mut arguments = Vec::with_capacity(nb_arguments.min(1024) as usize);
        for _ in 0..nb_arguments {
            arguments.push(channel.read::<String>()?);
        }
        parameters.push(Parameter { name, arguments });
    }
    Ok(parameters)
}

/// `u32` count, then (`u32` heuristic, `u32` feature) pairs.
pub fn write_features(writer: &mut PacketWriter, features: &[FeatureRef]) {
    writer.add(&(features.len() as u32));
    for feature in features {
        writer.add(&feature.heuristic).add(&feature.feature);
    }
}

pub fn read_features(channel: &mut Channel) -> Result<Vec<FeatureRef>, ChannelError> {
    let count = channel.read::<u32>()?;
    let mut features = Vec::with_capacity(count.min(65_536) as usize);
    for _ in 0..count {
        let heuristic = channel.read::<u32>()?;
        let feature = channel.read::<u32>()?;
        features.push(FeatureRef { heuristic, feature });
    }
    Ok(features)
}

/// `u32` count, then (`u32` label, `f32` score) pairs.
pub fn write_scores(writer: &mut PacketWriter, scores: &[LabelScore]) {
    writer.add(&(scores.len() as u32));
    for score in scores {
        writer.add(&score.label).add(&score.score);
    }
}

pub fn read_scores(channel: &mut Channel) -> Result<Vec<LabelScore>, ChannelError> {
    let count = channel.read::<u32>()?;
    let mut scores = Vec::with_capacity(count.min(65_536) as usize);
    for _ in 0..count {
        let label = channel.read::<u32>()?;
        let score = channel.read::<f32>()?;
        scores.push(LabelScore { label, score });
    }
    Ok(scores)
}

/// Per entry: `u64` total microseconds, `u32` events, `u32` subevents;
/// then the `u64` memory peak.
pub fn write_statistics(writer: &mut PacketWriter, statistics: &HeuristicStatistics) {
    for entry in statistics.entries() {
        writer
            .add(&(entry.total.as_micros() as u64))
            .add(&entry.events)
            .add(&entry.subevents);
    }
    writer.add(&statistics.max_memory);
}

pub fn read_statistics(channel: &mut Channel) -> Result<HeuristicStatistics, ChannelError> {
    let mut entries = [StatisticsEntry::default(); 5];
    for entry in &mut entries {
        entry.total = Duration::from_micros(channel.read::<u64>()?);
        entry.events = channel.read::<u32>()?;
        entry.subevents = channel.read::<u32>()?;
    }
    let [initialization, sequences, images, positions, features] = entries;
    Ok(HeuristicStatistics {
        initialization,
        sequences,
        images,
        positions,
        features,
        max_memory: channel.read::<u64>()?,
    })
}

fn read_position(channel: &mut Channel) -> Result<Coordinates, ChannelError> {
    Ok(Coordinates::new(channel.read::<u32>()?, channel.read::<u32>()?))
}

/// `u32` count, the feature indexes, then as many `f32` values.
fn write_feature_values(writer: &mut PacketWriter, indexes: &[u32], values: &[f32]) {
    writer
        .add(&(indexes.len() as u32))
        .add_u32_block(indexes)
        .add_f32_block(values);
}

fn read_feature_values(channel: &mut Channel) -> Result<(Vec<u32>, Vec<f32>), ChannelError> {
    let count = channel.read::<u32>()? as usize;
    let indexes = channel.read_u32_block(count)?;
    let values = channel.read_f32_block(count)?;
    Ok((indexes, values))
}

pub fn write_classification_done(writer: &mut PacketWriter, event: &ClassificationDone) {
    writer
        .add(&event.image)
        .add(&event.original_image)
        .add(&event.position.x)
        .add(&event.position.y)
        .add(&(event.error as u32));
    write_scores(writer, &event.results);
}

pub fn read_classification_done(channel: &mut Channel) -> Result<ClassificationDone, ChannelError> {
    let image = channel.read::<u32>()?;
    let original_image = channel.read::<u32>()?;
    let position = read_position(channel)?;
    let error = channel.read::<u32>()?;
    let error = ClassificationError::from_u32(error).ok_or(PacketError::InvalidEnum {
        field: "classification error",
        value: error,
    })?;
    Ok(ClassificationDone {
        image,
        original_image,
        position,
        results: read_scores(channel)?,
        error,
    })
}

pub fn write_classifier_features(writer: &mut PacketWriter, event: &ClassifierFeatures) {
    writer
        .add(&event.detection)
        .add(&event.training)
        .add(&event.image)
        .add(&event.original_image)
        .add(&event.position.x)
        .add(&event.position.y)
        .add(&event.roi_extent)
        .add(&event.heuristic);
    write_feature_values(writer, &event.indexes, &event.values);
}

pub fn read_classifier_features(channel: &mut Channel) -> Result<ClassifierFeatures, ChannelError> {
    let detection = channel.read::<bool>()?;
    let training = channel.read::<bool>()?;
    let image = channel.read::<u32>()?;
    let original_image = channel.read::<u32>()?;
    let position = read_position(channel)?;
    let roi_extent = channel.read::<u32>()?;
    let heuristic = channel.read::<u32>()?;
    let (indexes, values) = read_feature_values(channel)?;
    Ok(ClassifierFeatures {
        detection,
        training,
        image,
        original_image,
        position,
        roi_extent,
        heuristic,
        indexes,
        values,
    })
}

pub fn write_planner_features(writer: &mut PacketWriter, event: &PlannerFeatures) {
    writer
        .add(&event.sequence)
        .add(&event.view)
        .add(&event.frame)
        .add(&event.position.x)
        .add(&event.position.y)
        .add(&event.roi_extent)
        .add(&event.heuristic);
    write_feature_values(writer, &event.indexes, &event.values);
}

pub fn read_planner_features(channel: &mut Channel) -> Result<PlannerFeatures, ChannelError> {
    let sequence = channel.read::<u32>()?;
    let view = channel.read::<u32>()?;
    let frame = channel.read::<u32>()?;
    let position = read_position(channel)?;
    let roi_extent = channel.read::<u32>()?;
    let heuristic = channel.read::<u32>()?;
    let (indexes, values) = read_feature_values(channel)?;
    Ok(PlannerFeatures {
        sequence,
        view,
        frame,
        position,
        roi_extent,
        heuristic,
        indexes,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use std::time::Duration;

    #[test]
    fn parameters_keep_order_and_arguments() {
        let (mut master, mut slave) = Channel::pair().unwrap();
        let parameters = vec![
            Parameter::new("depth", ["3"]),
            Parameter::new("weights", ["0.5", "0.25", "0.25"]),
            Parameter::new("verbose", Vec::<String>::new()),
        ];
        write_parameters(master.start_packet(MessageKind::ClassifierSetup), &parameters);
        master.send_packet().unwrap();

        slave.receive_packet(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(read_parameters(&mut slave).unwrap(), parameters);
        assert!(slave.is_at_end());
    }

    #[test]
    fn truncated_feature_list_is_end_of_packet() {
        let (mut master, mut slave) = Channel::pair().unwrap();
        master
            .start_packet(MessageKind::Response)
            .add(&2u32)
            .add(&7u32)
            .add(&1u32);
        master.send_packet().unwrap();

        slave.receive_packet(Some(Duration::from_secs(1))).unwrap();
        let err = read_features(&mut slave).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn statistics_travel_in_microseconds() {
        let (mut master, mut slave) = Channel::pair().unwrap();
        let statistics = HeuristicStatistics {
            images: StatisticsEntry {
                total: Duration::from_micros(1_250),
                events: 2,
                subevents: 640,
            },
            max_memory: 4096,
            ..HeuristicStatistics::default()
        };
        write_statistics(slave.start_packet(MessageKind::Response), &statistics);
        slave.send_packet().unwrap();

        master.receive_packet(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(read_statistics(&mut master).unwrap(), statistics);
        assert!(master.is_at_end());
    }

    #[test]
    fn unknown_classification_error_is_rejected() {
        let (mut master, mut slave) = Channel::pair().unwrap();
        master
            .start_packet(MessageKind::EventClassificationDone)
            .add(&1u32)
            .add(&1u32)
            .add(&0u32)
            .add(&0u32)
            .add(&9u32)
            .add(&0u32);
        master.send_packet().unwrap();

        slave.receive_packet(Some(Duration::from_secs(1))).unwrap();
        assert!(read_classification_done(&mut slave).is_err());
    }
}
