// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request interface of the stream.
//!
//! The stream lives on its own thread, running its timers between the
//! requests posted from other threads. Every request is answered through a
//! callback carrying a `Status`, called on the stream thread.

use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tokio::time::Instant;

use crate::audio::AudioDevice;
use crate::clock::{time_sub, LocalClock, Time};
use crate::endpoint::{ConfigValue, ConnectionId, Direction, EndpointId};
use crate::error::{Result, Status};
use crate::link::LinkParams;
use crate::operator::Operator;
use crate::sco::LinkKind;
use crate::stream::{Acquired, Device, Stream};
use crate::transform::TransformId;

/// Local time of the stream thread, from the monotonic clock
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalClock for MonotonicClock {
    fn now(&self) -> Time {
        self.origin.elapsed().as_micros() as Time
    }
}

type AcquireCallback = Box<dyn FnOnce(Status, Option<EndpointId>) + Send + 'static>;

/// Access to the stream, given to the requests on the stream thread
pub struct StreamViews<'a> {
    pub stream: &'a mut Stream,
    /// Answers of `get_endpoint` waiting for their hardware
    pending: &'a mut HashMap<EndpointId, Vec<AcquireCallback>>,
}

type BoxedStreamCallback = Box<dyn for<'a> FnOnce(&'a mut StreamViews) + Send + 'static>;

#[derive(Default, Debug)]
enum Runner {
    #[default]
    NotStarted,
    /// Requests are accepted, see [`Runner::send`]
    Running { tx: mpsc::UnboundedSender<BoxedStreamCallback> },
    /// The loop ends once the requests queued are handled
    Stopping,
    /// `result` holds an error if the loop did not end gracefully
    Ended { result: std::result::Result<(), String> },
}

impl Runner {
    fn send(
        &self,
        f: BoxedStreamCallback,
    ) -> std::result::Result<(), (String, BoxedStreamCallback)> {
        match self {
            Self::NotStarted => Err(("Not started yet".to_string(), f)),
            Self::Ended { .. } | Self::Stopping => Err(("Runner ended".to_string(), f)),
            Self::Running { tx } => tx.send(f).map_err(|e| ("Failed to send".to_string(), e.0)),
        }
    }

    fn start(
        &mut self,
    ) -> std::result::Result<mpsc::UnboundedReceiver<BoxedStreamCallback>, String> {
        match self {
            Self::Running { .. } => return Err("Already started".to_string()),
            Self::Ended { result } => return Err(format!("Already finished: {result:?}")),
            Self::Stopping => return Err("Can't start, finishing".to_string()),
            Self::NotStarted => {}
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self = Self::Running { tx };
        Ok(rx)
    }

    fn shutdown(&mut self) {
        match std::mem::replace(self, Self::Stopping) {
            Self::NotStarted => {
                warn!("Runner being stopped when it hasn't been started");
                *self = Self::Ended { result: Err("Never started".to_string()) };
            }
            Self::Stopping => warn!("Asked to shutdown twice before stopped"),
            ended @ Self::Ended { .. } => *self = ended,
            Self::Running { .. } => {}
        }
    }

    fn finished(
        &mut self,
        result: std::result::Result<(), String>,
    ) -> std::result::Result<(), String> {
        match self {
            Self::NotStarted => return Err("Not started".to_string()),
            Self::Ended { result } => return Err(format!("Already finished with {result:?}")),
            Self::Running { .. } | Self::Stopping => {}
        }

        *self = Self::Ended { result };
        Ok(())
    }
}

/// Handle of the stream thread. The thread is stopped and joined on drop.
pub struct StreamService {
    runner: Arc<Mutex<Runner>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamService {
    /// Start the stream thread; `build` makes the stream on that thread
    pub fn start<F>(build: F) -> Self
    where
        F: FnOnce() -> Stream + Send + 'static,
    {
        let runner = Arc::new(Mutex::new(Runner::NotStarted));
        let rx = match runner.lock().unwrap().start() {
            Ok(rx) => rx,
            Err(reason) => panic!("Cannot start the stream: {reason}"),
        };
        let thread = {
            let runner = runner.clone();
            thread::spawn(move || Self::thread_loop(runner, rx, build))
        };
        Self { runner, thread: Some(thread) }
    }

    fn thread_loop<F>(
        runner: Arc<Mutex<Runner>>,
        mut rx: mpsc::UnboundedReceiver<BoxedStreamCallback>,
        build: F,
    ) where
        F: FnOnce() -> Stream,
    {
        let rt = Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to start tokio runtime");
        let local = LocalSet::new();

        let result = local.block_on(&rt, async move {
            let mut stream = build();
            let mut pending = HashMap::new();

            info!("starting stream loop");
            loop {
                let sleep_for = match stream.next_deadline() {
                    Some(at) => Duration::from_micros(time_sub(at, stream.now()).max(0) as u64),
                    None => Duration::from_secs(3600),
                };
                tokio::select! {
                    f = rx.recv() => {
                        let Some(f) = f else {
                            break;
                        };
                        f(&mut StreamViews { stream: &mut stream, pending: &mut pending });
                    }
                    _ = tokio::time::sleep_until(Instant::now() + sleep_for) => {}
                }
                stream.service_timers();
            }
            Ok::<(), String>(())
        });
        warn!("stream loop has stopped");

        if let Err(e) = runner.lock().unwrap().finished(result) {
            warn!("failed to record runner finish: {e:?}");
        }
    }

    /// Stop accepting requests; the loop ends after the queued ones
    pub fn stop(&self) {
        self.runner.lock().unwrap().shutdown();
    }

    pub fn has_ended(&self) -> bool {
        matches!(*self.runner.lock().unwrap(), Runner::Ended { .. })
    }

    /// Post `f` to the stream thread
    pub fn do_in_stream_thread<F>(&self, f: F)
    where
        F: for<'a> FnOnce(&'a mut StreamViews) + Send + 'static,
    {
        if let Err((s, _f)) = self.runner.lock().unwrap().send(Box::new(f)) {
            error!("Failed to do_in_stream_thread: {s}");
        }
    }

    fn request<T, Op, Cb>(&self, name: &'static str, op: Op, callback: Cb)
    where
        T: 'static,
        Op: FnOnce(&mut Stream) -> Result<T> + Send + 'static,
        Cb: FnOnce(Status, Option<T>) + Send + 'static,
    {
        self.do_in_stream_thread(move |views| {
            let result = op(views.stream);
            if let Err(e) = &result {
                error!("{name}: {e}");
            }
            callback(Status::from(&result), result.ok());
        });
    }

    async fn request_async<T, Op>(&self, name: &'static str, op: Op) -> (Status, Option<T>)
    where
        T: Send + 'static,
        Op: FnOnce(&mut Stream) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.request(name, op, move |status, value| {
            let _ = tx.send((status, value));
        });
        rx.await.unwrap_or((Status::CmdFailed, None))
    }

    // Setup, from the platform

    pub fn add_operator<F>(&self, opid: u16, make: F)
    where
        F: FnOnce() -> Box<dyn Operator> + Send + 'static,
    {
        self.request("add_operator", move |s| s.add_operator(opid, make()), |_, _| {});
    }

    pub fn create_link_endpoints(
        &self,
        kind: LinkKind,
        hci_handle: u16,
        callback: impl FnOnce(Status, Option<(EndpointId, EndpointId)>) + Send + 'static,
    ) {
        self.request(
            "create_link_endpoints",
            move |s| s.create_link_endpoints(kind, hci_handle, 0, 0),
            callback,
        );
    }

    pub fn delete_link_endpoints(
        &self,
        hci_handle: u16,
        callback: impl FnOnce(Status) + Send + 'static,
    ) {
        self.request(
            "delete_link_endpoints",
            move |s| s.delete_link_endpoints(hci_handle),
            |status, _| callback(status),
        );
    }

    pub fn link_params_update(&self, hci_handle: u16, params: LinkParams) {
        self.request(
            "link_params_update",
            move |s| s.link_params_update(hci_handle, params),
            |_, _| {},
        );
    }

    /// Completion of a hardware acquisition answered as pending
    pub fn audio_acquired(&self, id: EndpointId, device: Option<Box<dyn AudioDevice + Send>>) {
        self.do_in_stream_thread(move |views| {
            let device = device.map(|d| d as Box<dyn AudioDevice>);
            let result = views.stream.audio_acquired(id, device);
            if let Err(e) = &result {
                error!("audio_acquired: {e}");
            }
            for callback in views.pending.remove(&id).unwrap_or_default() {
                match result {
                    Ok(()) => callback(Status::Ok, Some(id)),
                    Err(_) => callback(Status::CmdFailed, None),
                }
            }
        });
    }

    // Client requests

    /// Answered once the hardware of the endpoint is acquired
    pub fn get_endpoint(
        &self,
        con: ConnectionId,
        device: Device,
        dir: Direction,
        callback: impl FnOnce(Status, Option<EndpointId>) + Send + 'static,
    ) {
        self.do_in_stream_thread(move |views| match views.stream.get_endpoint(con, device, dir) {
            Ok(Acquired::Ready(id)) => callback(Status::Ok, Some(id)),
            Ok(Acquired::Pending(id)) => {
                info!("{}: waiting for the hardware of {:?}", id, device);
                views.pending.entry(id).or_default().push(Box::new(callback));
            }
            Err(e) => {
                error!("get_endpoint: {e}");
                callback(Status::CmdFailed, None);
            }
        });
    }

    pub async fn get_endpoint_async(
        &self,
        con: ConnectionId,
        device: Device,
        dir: Direction,
    ) -> (Status, Option<EndpointId>) {
        let (tx, rx) = oneshot::channel();
        self.get_endpoint(con, device, dir, move |status, id| {
            let _ = tx.send((status, id));
        });
        rx.await.unwrap_or((Status::CmdFailed, None))
    }

    pub fn close_endpoint(
        &self,
        con: ConnectionId,
        id: EndpointId,
        callback: impl FnOnce(Status) + Send + 'static,
    ) {
        self.request("close_endpoint", move |s| s.close_endpoint(con, id), |st, _| callback(st));
    }

    pub fn connect(
        &self,
        con: ConnectionId,
        source: EndpointId,
        sink: EndpointId,
        callback: impl FnOnce(Status, Option<TransformId>) + Send + 'static,
    ) {
        self.request("connect", move |s| s.connect(con, source, sink), callback);
    }

    pub async fn connect_async(
        &self,
        con: ConnectionId,
        source: EndpointId,
        sink: EndpointId,
    ) -> (Status, Option<TransformId>) {
        self.request_async("connect", move |s| s.connect(con, source, sink)).await
    }

    pub fn disconnect(
        &self,
        con: ConnectionId,
        tid: TransformId,
        callback: impl FnOnce(Status) + Send + 'static,
    ) {
        self.request("disconnect", move |s| s.disconnect(con, tid), |st, _| callback(st));
    }

    pub fn disconnect_endpoints(
        &self,
        con: ConnectionId,
        source: EndpointId,
        sink: EndpointId,
        callback: impl FnOnce(Status) + Send + 'static,
    ) {
        self.request(
            "disconnect_endpoints",
            move |s| s.disconnect_endpoints(con, source, sink),
            |st, _| callback(st),
        );
    }

    pub fn configure(
        &self,
        con: ConnectionId,
        id: EndpointId,
        key: u32,
        value: u32,
        callback: impl FnOnce(Status) + Send + 'static,
    ) {
        self.request("configure", move |s| s.configure(con, id, key, value), |st, _| callback(st));
    }

    pub fn get_config(
        &self,
        con: ConnectionId,
        id: EndpointId,
        key: u32,
        callback: impl FnOnce(Status, Option<ConfigValue>) + Send + 'static,
    ) {
        self.request("get_config", move |s| s.get_config(con, id, key), callback);
    }

    pub async fn get_config_async(
        &self,
        con: ConnectionId,
        id: EndpointId,
        key: u32,
    ) -> (Status, Option<ConfigValue>) {
        self.request_async("get_config", move |s| s.get_config(con, id, key)).await
    }

    pub fn sync_sids(
        &self,
        con: ConnectionId,
        id: EndpointId,
        peer: Option<EndpointId>,
        callback: impl FnOnce(Status) + Send + 'static,
    ) {
        self.request("sync_sids", move |s| s.sync_sids(con, id, peer), |st, _| callback(st));
    }

    pub fn start_endpoint(
        &self,
        con: ConnectionId,
        id: EndpointId,
        callback: impl FnOnce(Status) + Send + 'static,
    ) {
        self.request("start_endpoint", move |s| s.start_endpoint(con, id), |st, _| callback(st));
    }

    pub fn stop_endpoint(
        &self,
        con: ConnectionId,
        id: EndpointId,
        callback: impl FnOnce(Status, Option<bool>) + Send + 'static,
    ) {
        self.request("stop_endpoint", move |s| s.stop_endpoint(con, id), callback);
    }

    /// Run `f` on the stream thread, and wait for its outcome
    pub async fn inspect<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Stream) -> T + Send + 'static,
    {
        self.request_async("inspect", move |s| Ok(f(s))).await.1
    }
}

impl Drop for StreamService {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("stream thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{Acquire, AudioHardware};
    use crate::clock::{LinearWallclock, Wallclocks};
    use crate::endpoint::{DataFormat, EndpointType, StreamConfig};
    use crate::operator::{CopyOperator, Terminal};
    use crate::sco_src::SrcStats;
    use std::rc::Rc;
    use std::sync::mpsc as std_mpsc;

    const HANDLE: u16 = 0x41;
    const CON: ConnectionId = ConnectionId(7);

    struct NullDevice;

    impl AudioDevice for NullDevice {
        fn read(&mut self, samples: &mut [i32]) -> usize {
            samples.fill(0);
            samples.len()
        }

        fn write(&mut self, samples: &[i32]) -> usize {
            samples.len()
        }
    }

    struct DelayedHardware;

    impl AudioHardware for DelayedHardware {
        fn acquire(&mut self, _instance: u8, _channel: u8, _dir: Direction) -> Acquire {
            Acquire::Pending
        }

        fn release(&mut self, _instance: u8, _channel: u8, _dir: Direction) {}
    }

    /// Radio clock 0 is at the start of the stream
    fn service() -> StreamService {
        StreamService::start(|| {
            let clock = Rc::new(MonotonicClock::new());
            let mut clocks = Wallclocks::new();
            clocks.insert(1, LinearWallclock::new(0, clock.now()));
            let mut stream = Stream::new(clock, Box::new(clocks), StreamConfig::default());
            stream.set_audio_hardware(Box::new(DelayedHardware));
            stream
        })
    }

    fn params() -> LinkParams {
        LinkParams {
            tesco_us: 7500,
            wallclock_id: 1,
            from_air_length: 60,
            to_air_length: 60,
            from_air_latency_us: 1000,
            to_air_latency_us: 1000,
            next_slot: 0,
            iso: None,
        }
    }

    #[test]
    fn runner_states() {
        let mut runner = Runner::default();
        assert!(runner.send(Box::new(|_| {})).is_err());
        let _rx = runner.start().unwrap();
        assert!(runner.start().is_err());
        assert!(runner.send(Box::new(|_| {})).is_ok());

        runner.shutdown();
        assert!(runner.send(Box::new(|_| {})).is_err());
        assert!(runner.finished(Ok(())).is_ok());
        assert!(runner.finished(Ok(())).is_err());
    }

    #[test]
    fn requests_after_stop_are_dropped() {
        let service = service();
        service.stop();
        let (tx, rx) = std_mpsc::channel();
        let device = Device::Sco { hci_handle: HANDLE };
        service.get_endpoint(CON, device, Direction::Source, move |s, _| {
            tx.send(s).unwrap();
        });
        assert!(rx.recv().is_err());

        while !service.has_ended() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn callbacks_carry_status() {
        tokio_test::block_on(callbacks_carry_status_async());
    }

    async fn callbacks_carry_status_async() {
        let service = service();
        let device = Device::Sco { hci_handle: HANDLE };

        let (status, id) = service.get_endpoint_async(CON, device, Direction::Source).await;
        assert_eq!((status, id), (Status::CmdFailed, None));

        let (tx, rx) = oneshot::channel();
        service.create_link_endpoints(LinkKind::Sco, HANDLE, move |status, ids| {
            let _ = tx.send((status, ids));
        });
        let (status, Some((source, _))) = rx.await.unwrap() else { panic!("no endpoints") };
        assert_eq!(status, Status::Ok);

        let (status, id) = service.get_endpoint_async(CON, device, Direction::Source).await;
        assert_eq!((status, id), (Status::Ok, Some(source)));
        let (status, value) = service.get_config_async(CON, source, 0x0001).await;
        assert_eq!((status, value), (Status::Ok, Some(ConfigValue::Value(0))));
        let (status, _) = service.get_config_async(CON, source, 0xdead).await;
        assert_eq!(status, Status::CmdFailed);
    }

    #[tokio::test]
    async fn pending_acquisition() {
        let service = service();
        let (tx, rx) = oneshot::channel();
        service.get_endpoint(
            CON,
            Device::Audio { instance: 0, channel: 1 },
            Direction::Source,
            move |status, id| {
                let _ = tx.send((status, id));
            },
        );

        let id = service
            .inspect(|s| s.lookup(EndpointType::Audio, Direction::Source, 0x0001))
            .await
            .flatten()
            .unwrap();
        service.audio_acquired(id, Some(Box::new(NullDevice)));
        assert_eq!(rx.await.unwrap(), (Status::Ok, Some(id)));
    }

    #[tokio::test]
    async fn timers_drive_the_link() {
        let service = service();
        service.add_operator(1, || Box::new(CopyOperator::new(DataFormat::Fixp, 0)));
        service.create_link_endpoints(LinkKind::Sco, HANDLE, |_, _| {});
        service.link_params_update(HANDLE, params());

        let sco = Device::Sco { hci_handle: HANDLE };
        let (_, Some(source)) = service.get_endpoint_async(CON, sco, Direction::Source).await
        else {
            panic!("no source");
        };
        let op_sink = EndpointId::operator(1, Terminal::sink(0));
        let (status, _) = service.connect_async(CON, source, op_sink).await;
        assert_eq!(status, Status::Ok);

        let (tx, rx) = oneshot::channel();
        service.start_endpoint(CON, source, move |status| {
            let _ = tx.send(status);
        });
        assert_eq!(rx.await.unwrap(), Status::Ok);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let stats = service
            .inspect(move |s| {
                s.endpoint(source)
                    .and_then(|ep| ep.state.as_link())
                    .and_then(|link| link.src_stats())
            })
            .await
            .flatten()
            .unwrap_or(SrcStats::default());
        assert!(stats.synthesized > 0);
    }
}
