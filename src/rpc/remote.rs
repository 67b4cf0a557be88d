//! Sandbox-side stubs of the data interfaces.
//!
//! Each stub owns a copy of the host's channel handle (same transport, same
//! receive buffer) and turns every method into a blocking reverse call.
use super::calls::{InputSetCall, PerceptionCall, ReverseCall, TaskCall};
use crate::channel::{Channel, ChannelError};
use crate::config::types::ErrorCode;
use crate::plugin::{
    ActionOutcome, Coordinates, Dimensions, Image, InputSet, LabeledObject, Perception,
    PluginError, PluginResult, Task, TaskMode, TaskResult,
};
use crate::protocol::MessageKind;
use log::{debug, error};

/// Exit status of a sandboxed process whose trusted side went away.
pub const MASTER_GONE_EXIT_STATUS: i32 = 3;

/// End the sandboxed process from inside a plugin call.
///
/// Exit handlers and destructors belong to the plugin's half-finished state, so
/// none of them run.
fn leave(status: i32) -> ! {
    unsafe { libc::_exit(status) }
}

fn channel_error(err: ChannelError) -> PluginError {
    PluginError::new(err.code(), err.to_string())
}

/// Send `call` and block until its answer is the current packet.
///
/// Sandbox-side receives have no deadline: the trusted side enforces them.
fn call(channel: &mut Channel, request: &ReverseCall) -> PluginResult<()> {
    request.write(channel);
    send_or_exit(channel)?;

    loop {
        let kind = match channel.receive_packet(None) {
            Ok(kind) => kind,
            Err(ChannelError::MasterGone) => {
                error!("trusted process went away during {}", request.kind());
                leave(MASTER_GONE_EXIT_STATUS);
            }
            Err(err) => return Err(channel_error(err)),
        };
        match kind {
            MessageKind::KeepAlive => continue,
            MessageKind::Response => return Ok(()),
            MessageKind::Error => {
                let code = channel
                    .read::<u32>()
                    .ok()
                    .and_then(ErrorCode::from_u32)
                    .unwrap_or(ErrorCode::AppServerError);
                debug!("{} answered with error: {code}", request.kind());
                return Err(PluginError::from_code(code));
            }
            MessageKind::Terminate => {
                debug!("terminated during {}", request.kind());
                let _ = channel.send_empty(MessageKind::Response);
                leave(0);
            }
            other => {
                return Err(PluginError::new(
                    ErrorCode::ChannelUnexpectedResponse,
                    format!("{other} received while waiting for the answer to {}", request.kind()),
                ))
            }
        }
    }
}

fn send_or_exit(channel: &mut Channel) -> PluginResult<()> {
    match channel.send_packet() {
        Ok(()) => Ok(()),
        Err(ChannelError::MasterGone) => leave(MASTER_GONE_EXIT_STATUS),
        Err(err) => Err(channel_error(err)),
    }
}

fn read<T: crate::protocol::Decode>(channel: &mut Channel) -> PluginResult<T> {
    channel.read::<T>().map_err(channel_error)
}

fn read_size(channel: &mut Channel) -> PluginResult<Dimensions> {
    Ok(Dimensions {
        width: read(channel)?,
        height: read(channel)?,
    })
}

fn read_values(channel: &mut Channel, count: usize) -> PluginResult<Vec<f32>> {
    channel.read_f32_block(count).map_err(channel_error)
}

/// Input set of the classifier command in flight.
pub struct RemoteInputSet {
    channel: Channel,
    id: u32,
    detection: bool,
}

impl RemoteInputSet {
    pub fn new(channel: Channel, id: u32, detection: bool) -> Self {
        Self {
            channel,
            id,
            detection,
        }
    }

    fn ask(&mut self, request: InputSetCall) -> PluginResult<()> {
        call(&mut self.channel, &ReverseCall::InputSet(request))
    }

    fn ask_count(&mut self, request: InputSetCall) -> PluginResult<u32> {
        self.ask(request)?;
        read(&mut self.channel)
    }
}

impl InputSet for RemoteInputSet {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_doing_detection(&self) -> bool {
        self.detection
    }

    fn nb_heuristics(&mut self) -> PluginResult<u32> {
        self.ask_count(InputSetCall::NbHeuristics)
    }

    fn nb_features(&mut self, heuristic: u32) -> PluginResult<u32> {
        self.ask_count(InputSetCall::NbFeatures { heuristic })
    }

    fn heuristic_name(&mut self, heuristic: u32) -> PluginResult<String> {
        self.ask(InputSetCall::HeuristicName { heuristic })?;
        read(&mut self.channel)
    }

    fn heuristic_seed(&mut self, heuristic: u32) -> PluginResult<u32> {
        self.ask_count(InputSetCall::HeuristicSeed { heuristic })
    }

    fn nb_images(&mut self) -> PluginResult<u32> {
        self.ask_count(InputSetCall::NbImages)
    }

    fn nb_labels(&mut self) -> PluginResult<u32> {
        self.ask_count(InputSetCall::NbLabels)
    }

    fn compute_some_features(
        &mut self,
        image: u32,
        position: Coordinates,
        heuristic: u32,
        features: &[u32],
    ) -> PluginResult<Vec<f32>> {
        self.ask(InputSetCall::ComputeSomeFeatures {
            image,
            position,
            heuristic,
            features: features.to_vec(),
        })?;
        read_values(&mut self.channel, features.len())
    }

    fn objects_in_image(&mut self, image: u32) -> PluginResult<Vec<LabeledObject>> {
        self.ask(InputSetCall::ObjectsInImage { image })?;
        let count = read::<u32>(&mut self.channel)?;
        let mut objects = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            objects.push(LabeledObject {
                label: read(&mut self.channel)?,
                left: read(&mut self.channel)?,
                top: read(&mut self.channel)?,
                width: read(&mut self.channel)?,
                height: read(&mut self.channel)?,
            });
        }
        Ok(objects)
    }

    fn negatives_in_image(&mut self, image: u32) -> PluginResult<Vec<Coordinates>> {
        self.ask(InputSetCall::NegativesInImage { image })?;
        let count = read::<u32>(&mut self.channel)?;
        let mut positions = Vec::with_capacity(count.min(65_536) as usize);
        for _ in 0..count {
            positions.push(Coordinates {
                x: read(&mut self.channel)?,
                y: read(&mut self.channel)?,
            });
        }
        Ok(positions)
    }

    fn image_size(&mut self, image: u32) -> PluginResult<Dimensions> {
        self.ask(InputSetCall::ImageSize { image })?;
        read_size(&mut self.channel)
    }

    fn is_image_in_test_set(&mut self, image: u32) -> PluginResult<bool> {
        self.ask(InputSetCall::ImageInTestSet { image })?;
        read(&mut self.channel)
    }

    fn roi_extent(&mut self) -> PluginResult<u32> {
        self.ask_count(InputSetCall::RoiExtent)
    }
}

/// Perception of the goal-planner command in flight.
pub struct RemotePerception {
    channel: Channel,
    new_sequence: bool,
}

impl RemotePerception {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            new_sequence: false,
        }
    }

    /// Whether the current `choose_action` starts a new sequence.
    pub fn new_sequence(&self) -> bool {
        self.new_sequence
    }

    pub fn set_new_sequence(&mut self, new_sequence: bool) {
        self.new_sequence = new_sequence;
    }

    fn ask(&mut self, request: PerceptionCall) -> PluginResult<()> {
        call(&mut self.channel, &ReverseCall::Perception(request))
    }

    fn ask_count(&mut self, request: PerceptionCall) -> PluginResult<u32> {
        self.ask(request)?;
        read(&mut self.channel)
    }
}

impl Perception for RemotePerception {
    fn nb_heuristics(&mut self) -> PluginResult<u32> {
        self.ask_count(PerceptionCall::NbHeuristics)
    }

    fn nb_features(&mut self, heuristic: u32) -> PluginResult<u32> {
        self.ask_count(PerceptionCall::NbFeatures { heuristic })
    }

    fn heuristic_name(&mut self, heuristic: u32) -> PluginResult<String> {
        self.ask(PerceptionCall::HeuristicName { heuristic })?;
        read(&mut self.channel)
    }

    fn heuristic_seed(&mut self, heuristic: u32) -> PluginResult<u32> {
        self.ask_count(PerceptionCall::HeuristicSeed { heuristic })
    }

    fn nb_views(&mut self) -> PluginResult<u32> {
        self.ask_count(PerceptionCall::NbViews)
    }

    fn compute_some_features(
        &mut self,
        view: u32,
        position: Coordinates,
        heuristic: u32,
        features: &[u32],
    ) -> PluginResult<Vec<f32>> {
        self.ask(PerceptionCall::ComputeSomeFeatures {
            view,
            position,
            heuristic,
            features: features.to_vec(),
        })?;
        read_values(&mut self.channel, features.len())
    }

    fn view_size(&mut self, view: u32) -> PluginResult<Dimensions> {
        self.ask(PerceptionCall::ViewSize { view })?;
        read_size(&mut self.channel)
    }

    fn view_pixels(&mut self, view: u32) -> PluginResult<Image> {
        self.ask(PerceptionCall::ViewPixels { view })?;
        let size = read_size(&mut self.channel)?;
        let pixels = self
            .channel
            .read_raw(Image::expected_len(size.width, size.height))
            .map_err(channel_error)?;
        Ok(Image::new(size.width, size.height, pixels))
    }

    fn roi_extent(&mut self) -> PluginResult<u32> {
        self.ask_count(PerceptionCall::RoiExtent)
    }
}

/// Task of the learn command in flight. Mode, action count and trajectory
/// lengths never change during a command and are fetched once.
pub struct RemoteTask {
    channel: Channel,
    perception: RemotePerception,
    mode: Option<TaskMode>,
    nb_actions: Option<u32>,
    trajectory_lengths: Option<Vec<Option<u32>>>,
    suggested_action: Option<u32>,
}

impl RemoteTask {
    pub fn new(channel: Channel) -> Self {
        let perception = RemotePerception::new(channel.clone());
        Self {
            channel,
            perception,
            mode: None,
            nb_actions: None,
            trajectory_lengths: None,
            suggested_action: None,
        }
    }

    fn ask(&mut self, request: TaskCall) -> PluginResult<()> {
        call(&mut self.channel, &ReverseCall::Task(request))
    }
}

impl Task for RemoteTask {
    fn mode(&mut self) -> PluginResult<TaskMode> {
        if let Some(mode) = self.mode {
            return Ok(mode);
        }
        self.ask(TaskCall::Mode)?;
        let value = read::<u32>(&mut self.channel)?;
        let mode = TaskMode::from_u32(value).ok_or_else(|| {
            PluginError::new(ErrorCode::ChannelProtocol, format!("unknown task mode {value}"))
        })?;
        self.mode = Some(mode);
        Ok(mode)
    }

    fn nb_actions(&mut self) -> PluginResult<u32> {
        if let Some(count) = self.nb_actions {
            return Ok(count);
        }
        self.ask(TaskCall::NbActions)?;
        let count = read::<u32>(&mut self.channel)?;
        self.nb_actions = Some(count);
        Ok(count)
    }

    fn nb_trajectories(&mut self) -> PluginResult<u32> {
        if let Some(lengths) = &self.trajectory_lengths {
            return Ok(lengths.len() as u32);
        }
        self.ask(TaskCall::NbTrajectories)?;
        let count = read::<u32>(&mut self.channel)?;
        self.trajectory_lengths = Some(vec![None; count as usize]);
        Ok(count)
    }

    fn trajectory_length(&mut self, trajectory: u32) -> PluginResult<u32> {
        if trajectory >= self.nb_trajectories()? {
            return Err(PluginError::new(
                ErrorCode::InvalidArguments,
                format!("no trajectory {trajectory}"),
            ));
        }
        let index = trajectory as usize;
        if let Some(Some(length)) = self.trajectory_lengths.as_ref().map(|l| l[index]) {
            return Ok(length);
        }
        self.ask(TaskCall::TrajectoryLength { trajectory })?;
        let length = read::<u32>(&mut self.channel)?;
        if let Some(lengths) = self.trajectory_lengths.as_mut() {
            lengths[index] = Some(length);
        }
        Ok(length)
    }

    fn reset(&mut self) -> PluginResult<()> {
        self.ask(TaskCall::Reset)?;
        self.suggested_action = None;
        Ok(())
    }

    fn perform_action(&mut self, action: u32) -> PluginResult<ActionOutcome> {
        if action >= self.nb_actions()? {
            return Err(PluginError::new(
                ErrorCode::InvalidArguments,
                format!("no action {action}"),
            ));
        }
        // The answer layout depends on the mode; know it before asking.
        let mode = self.mode()?;
        self.ask(TaskCall::PerformAction { action })?;

        let reward = read::<f32>(&mut self.channel)?;
        let result = read::<u32>(&mut self.channel)?;
        let suggested_action = if mode.has_suggestions() {
            Some(read::<u32>(&mut self.channel)?)
        } else {
            None
        };
        self.suggested_action = suggested_action;
        Ok(ActionOutcome {
            reward,
            result: TaskResult::from_u32(result).unwrap_or(TaskResult::None),
            suggested_action,
        })
    }

    fn suggested_action(&mut self) -> PluginResult<u32> {
        if let Some(action) = self.suggested_action {
            return Ok(action);
        }
        self.ask(TaskCall::SuggestedAction)?;
        let action = read::<u32>(&mut self.channel)?;
        self.suggested_action = Some(action);
        Ok(action)
    }

    fn perception(&mut self) -> &mut dyn Perception {
        &mut self.perception
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Endpoint;
    use crate::rpc::ReverseCallTable;
    use nix::fcntl::OFlag;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::ForkResult;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Descriptors of a pair whose master end is built on another thread.
    fn split_pair() -> ((RawFd, RawFd), Channel) {
        let (to_slave_read, to_slave_write) = nix::unistd::pipe().unwrap();
        let (to_master_read, to_master_write) = nix::unistd::pipe().unwrap();
        let slave = Channel::from_fds(to_slave_read, to_master_write, Endpoint::Slave);
        ((to_master_read, to_slave_write), slave)
    }

    fn master_from((read_fd, write_fd): (RawFd, RawFd)) -> Channel {
        Channel::from_fds(read_fd, write_fd, Endpoint::Master)
    }

    struct Labels;

    impl InputSet for Labels {
        fn id(&self) -> u32 {
            4
        }
        fn is_doing_detection(&self) -> bool {
            false
        }
        fn nb_heuristics(&mut self) -> PluginResult<u32> {
            Ok(3)
        }
        fn nb_features(&mut self, _heuristic: u32) -> PluginResult<u32> {
            Ok(8)
        }
        fn heuristic_name(&mut self, heuristic: u32) -> PluginResult<String> {
            Ok(format!("h{heuristic}"))
        }
        fn heuristic_seed(&mut self, heuristic: u32) -> PluginResult<u32> {
            Ok(heuristic * 11)
        }
        fn nb_images(&mut self) -> PluginResult<u32> {
            Ok(2)
        }
        fn nb_labels(&mut self) -> PluginResult<u32> {
            Ok(5)
        }
        fn compute_some_features(
            &mut self,
            image: u32,
            _position: Coordinates,
            _heuristic: u32,
            features: &[u32],
        ) -> PluginResult<Vec<f32>> {
            if image > 1 {
                return Err(PluginError::from_code(ErrorCode::InvalidArguments));
            }
            Ok(features.iter().map(|f| *f as f32 / 2.0).collect())
        }
        fn objects_in_image(&mut self, _image: u32) -> PluginResult<Vec<LabeledObject>> {
            Ok(vec![LabeledObject {
                label: 1,
                left: 2,
                top: 3,
                width: 4,
                height: 5,
            }])
        }
        fn negatives_in_image(&mut self, _image: u32) -> PluginResult<Vec<Coordinates>> {
            Ok(vec![Coordinates::new(9, 9)])
        }
        fn image_size(&mut self, _image: u32) -> PluginResult<Dimensions> {
            Ok(Dimensions {
                width: 64,
                height: 48,
            })
        }
        fn is_image_in_test_set(&mut self, image: u32) -> PluginResult<bool> {
            Ok(image == 1)
        }
        fn roi_extent(&mut self) -> PluginResult<u32> {
            Ok(12)
        }
    }

    /// Trusted side: answer reverse calls until `Response` arrives from the plugin.
    fn serve(fds: (RawFd, RawFd)) -> usize {
        let mut master = master_from(fds);
        let mut input_set = Labels;
        let mut table = ReverseCallTable::InputSet(&mut input_set);
        let mut answered = 0;
        loop {
            let kind = master.receive_packet(Some(Duration::from_secs(5))).unwrap();
            if kind == MessageKind::Response {
                return answered;
            }
            let call = ReverseCall::read(kind, &mut master).unwrap().unwrap();
            table.dispatch(&call, &mut master).unwrap();
            answered += 1;
        }
    }

    #[test]
    fn stub_calls_are_answered_by_the_table() {
        let (fds, slave) = split_pair();
        let server = thread::spawn(move || serve(fds));

        let mut remote = RemoteInputSet::new(slave.clone(), 4, false);
        assert_eq!(remote.nb_heuristics().unwrap(), 3);
        assert_eq!(remote.heuristic_name(2).unwrap(), "h2");
        assert_eq!(
            remote
                .compute_some_features(0, Coordinates::new(1, 1), 0, &[2, 4, 6])
                .unwrap(),
            vec![1.0, 2.0, 3.0]
        );
        assert_eq!(remote.objects_in_image(0).unwrap()[0].height, 5);
        assert_eq!(remote.negatives_in_image(0).unwrap(), vec![Coordinates::new(9, 9)]);
        assert_eq!(remote.image_size(0).unwrap().width, 64);
        assert!(remote.is_image_in_test_set(1).unwrap());

        let err = remote
            .compute_some_features(7, Coordinates::new(0, 0), 0, &[1])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArguments);
        assert_eq!(remote.roi_extent().unwrap(), 12, "session usable after an application error");

        let mut done = slave;
        done.send_empty(MessageKind::Response).unwrap();
        assert_eq!(server.join().unwrap(), 9);
    }

    #[test]
    fn keep_alive_is_skipped_while_waiting() {
        let (fds, slave) = split_pair();
        let server = thread::spawn(move || {
            let mut master = master_from(fds);
            let kind = master.receive_packet(Some(Duration::from_secs(5))).unwrap();
            assert_eq!(kind, MessageKind::TaskNbActions);
            master.send_empty(MessageKind::KeepAlive).unwrap();
            master.start_packet(MessageKind::Response).add(&6u32);
            master.send_packet().unwrap();
            // Stay open until the stub has read its answer.
            let _ = master.receive_packet(Some(Duration::from_secs(5)));
        });

        let mut task = RemoteTask::new(slave.clone());
        assert_eq!(task.nb_actions().unwrap(), 6);
        assert_eq!(task.nb_actions().unwrap(), 6, "cached");
        let mut done = slave;
        done.send_empty(MessageKind::Response).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn unexpected_kind_is_reported() {
        let (fds, slave) = split_pair();
        let server = thread::spawn(move || {
            let mut master = master_from(fds);
            master.receive_packet(Some(Duration::from_secs(5))).unwrap();
            master.send_empty(MessageKind::Pong).unwrap();
            let _ = master.receive_packet(Some(Duration::from_secs(5)));
        });

        let mut perception = RemotePerception::new(slave.clone());
        let err = perception.nb_views().unwrap_err();
        assert_eq!(err.code, ErrorCode::ChannelUnexpectedResponse);
        let mut done = slave;
        done.send_empty(MessageKind::Response).unwrap();
        server.join().unwrap();
    }

    static EXIT_MARK_FD: AtomicI32 = AtomicI32::new(-1);

    extern "C" fn mark_exit_handlers_ran() {
        let fd = EXIT_MARK_FD.load(Ordering::SeqCst);
        unsafe {
            libc::write(fd, b"x".as_ptr().cast(), 1);
        }
    }

    #[test]
    fn terminate_during_a_call_skips_exit_handlers() {
        let (fds, slave) = split_pair();
        let (mark_read, mark_write) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).unwrap();

        match unsafe { nix::unistd::fork() }.unwrap() {
            ForkResult::Child => {
                EXIT_MARK_FD.store(mark_write, Ordering::SeqCst);
                unsafe {
                    libc::atexit(mark_exit_handlers_ran);
                }
                let mut task = RemoteTask::new(slave);
                let _ = task.nb_actions();
                unsafe { libc::_exit(9) }
            }
            ForkResult::Parent { child } => {
                nix::unistd::close(mark_write).unwrap();
                let mut master = master_from(fds);
                let kind = master.receive_packet(Some(Duration::from_secs(5))).unwrap();
                assert_eq!(kind, MessageKind::TaskNbActions);
                master.send_empty(MessageKind::Terminate).unwrap();
                let kind = master.receive_packet(Some(Duration::from_secs(5))).unwrap();
                assert_eq!(kind, MessageKind::Response);
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));

                let mut byte = [0u8; 1];
                let read = nix::unistd::read(mark_read, &mut byte).unwrap_or(0);
                assert_eq!(read, 0, "exit handlers ran in the sandboxed process");
                drop(slave);
            }
        }
    }
}
