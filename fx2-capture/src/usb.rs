// Copyright 2026 fx2-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! USB backend seam
//!
//! The device session and the transfer engine only talk to the device through
//! the three traits below:
//!
//! ```text
//!   UsbBackend ──open(id)──▶ UsbHandle ──bulk_in_queue(ep)──▶ BulkQueue
//!                              │                               │
//!                              ├─ control_out (vendor, device) ├─ submit(buf, len)
//!                              └─ control_in  (vendor, device) ├─ poll_complete()
//!                                                              └─ cancel_all()
//! ```
//!
//! [`NusbBackend`] drives real hardware through `nusb`. [`mock::MockUsb`] is a
//! scripted in-memory device used by the tests.

use std::collections::VecDeque;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use nusb::transfer::{Control, ControlType, Queue, Recipient, RequestBuffer, TransferError};

use crate::protocol::{UsbId, USB_CONFIGURATION, USB_INTERFACE};

/// USB layer errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsbError {
    /// No device with the requested identifiers is attached
    #[error("device not found")]
    NotFound,
    /// The device went away
    #[error("device disconnected")]
    Disconnected,
    /// The endpoint returned STALL
    #[error("endpoint stalled")]
    Stall,
    /// The transfer was cancelled before completing
    #[error("transfer cancelled")]
    Cancelled,
    /// Open, configuration or claim failure
    #[error("usb i/o error: {0}")]
    Io(String),
    /// Any other transfer failure
    #[error("transfer error: {0}")]
    Transfer(String),
}

impl UsbError {
    /// Whether the device is gone and resubmitting cannot succeed
    pub fn is_fatal(&self) -> bool {
        matches!(self, UsbError::Disconnected)
    }
}

impl From<TransferError> for UsbError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => UsbError::Cancelled,
            TransferError::Stall => UsbError::Stall,
            TransferError::Disconnected => UsbError::Disconnected,
            other => UsbError::Transfer(other.to_string()),
        }
    }
}

impl From<std::io::Error> for UsbError {
    fn from(err: std::io::Error) -> Self {
        UsbError::Io(err.to_string())
    }
}

/// A finished bulk transfer. `data` is the submitted buffer, truncated to the
/// bytes actually received.
#[derive(Debug)]
pub struct Completion {
    /// Received bytes
    pub data: Vec<u8>,
    /// Transfer outcome
    pub status: Result<(), UsbError>,
}

/// Opens devices by identifier
pub trait UsbBackend: Send + Sync + 'static {
    /// Handle to an opened, configured device
    type Handle: UsbHandle;

    /// Open the device with `id`, select configuration 1 and claim interface
    /// 0. Returns [`UsbError::NotFound`] when no such device is attached.
    fn open(&self, id: UsbId) -> Result<Self::Handle, UsbError>;
}

/// Opened device with interface 0 claimed
pub trait UsbHandle: Send + 'static {
    /// Bulk IN queue type
    type Queue: BulkQueue;

    /// Identifiers the device was opened under
    fn id(&self) -> UsbId;

    /// Vendor OUT control transfer to the device recipient
    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Vendor IN control transfer from the device recipient
    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, UsbError>;

    /// Queue of bulk IN transfers on `endpoint`. Transfers pending longer than
    /// `timeout` are cancelled.
    fn bulk_in_queue(&self, endpoint: u8, timeout: Duration) -> Self::Queue;
}

/// Queue of in-flight bulk IN transfers, completed in submission order
pub trait BulkQueue: Send + 'static {
    /// Submit `buf` to receive up to `len` bytes
    fn submit(&mut self, buf: Vec<u8>, len: usize) -> Result<(), UsbError>;

    /// Next finished transfer, without blocking
    fn poll_complete(&mut self) -> Option<Completion>;

    /// Transfers submitted and not yet returned by `poll_complete`
    fn pending(&self) -> usize;

    /// Request cancellation of every pending transfer; they still complete
    /// through `poll_complete`
    fn cancel_all(&mut self);
}

/// Hardware backend
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBackend;

impl UsbBackend for NusbBackend {
    type Handle = NusbHandle;

    fn open(&self, id: UsbId) -> Result<NusbHandle, UsbError> {
        let info = nusb::list_devices()?
            .find(|d| d.vendor_id() == id.vendor_id && d.product_id() == id.product_id)
            .ok_or(UsbError::NotFound)?;

        let device = info.open()?;
        device.set_configuration(USB_CONFIGURATION)?;
        let interface = device.claim_interface(USB_INTERFACE)?;
        log::debug!("Opened usb device {id}");

        Ok(NusbHandle {
            id,
            _device: device,
            interface,
        })
    }
}

/// Opened `nusb` device
pub struct NusbHandle {
    id: UsbId,
    _device: nusb::Device,
    interface: nusb::Interface,
}

fn vendor_control(request: u8, value: u16, index: u16) -> Control {
    Control {
        control_type: ControlType::Vendor,
        recipient: Recipient::Device,
        request,
        value,
        index,
    }
}

impl UsbHandle for NusbHandle {
    type Queue = NusbQueue;

    fn id(&self) -> UsbId {
        self.id
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        Ok(self
            .interface
            .control_out_blocking(vendor_control(request, value, index), data, timeout)?)
    }

    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, UsbError> {
        let mut buf = vec![0u8; len];
        let read = self.interface.control_in_blocking(
            vendor_control(request, value, index),
            &mut buf,
            timeout,
        )?;
        buf.truncate(read);
        Ok(buf)
    }

    fn bulk_in_queue(&self, endpoint: u8, timeout: Duration) -> NusbQueue {
        NusbQueue {
            queue: self.interface.bulk_in_queue(endpoint),
            deadlines: TransferDeadlines::new(timeout),
        }
    }
}

/// Submission times of pending transfers, used to emulate a per-transfer
/// timeout on top of a queue that has none.
///
/// Once a cancel is issued, the transfers that were pending at that moment
/// have to drain before the timeout is checked again. Transfers resubmitted
/// in the meantime are timed from their own submission.
#[derive(Debug)]
struct TransferDeadlines {
    timeout: Duration,
    /// Oldest first
    submitted_at: VecDeque<Instant>,
    /// Cancelled transfers not yet completed
    draining: usize,
}

impl TransferDeadlines {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            submitted_at: VecDeque::new(),
            draining: 0,
        }
    }

    fn submitted(&mut self, now: Instant) {
        self.submitted_at.push_back(now);
    }

    /// Whether the oldest transfer has run past the timeout. A `true` return
    /// marks every pending transfer as draining.
    fn expired(&mut self, now: Instant) -> bool {
        if self.draining > 0 {
            return false;
        }
        let expired = self
            .submitted_at
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= self.timeout);
        if expired {
            self.cancelled();
        }
        expired
    }

    fn cancelled(&mut self) {
        self.draining = self.submitted_at.len();
    }

    fn completed(&mut self) {
        self.submitted_at.pop_front();
        self.draining = self.draining.saturating_sub(1);
    }
}

/// `nusb` bulk IN queue with a per-transfer timeout
pub struct NusbQueue {
    queue: Queue<RequestBuffer>,
    deadlines: TransferDeadlines,
}

impl BulkQueue for NusbQueue {
    fn submit(&mut self, buf: Vec<u8>, len: usize) -> Result<(), UsbError> {
        self.queue.submit(RequestBuffer::reuse(buf, len));
        self.deadlines.submitted(Instant::now());
        Ok(())
    }

    fn poll_complete(&mut self) -> Option<Completion> {
        // poll_next panics on an empty queue
        if self.queue.pending() == 0 {
            return None;
        }

        if self.deadlines.expired(Instant::now()) {
            log::debug!("Bulk transfer timed out, cancelling pending transfers");
            self.queue.cancel_all();
        }

        let mut cx = Context::from_waker(Waker::noop());
        match self.queue.poll_next(&mut cx) {
            Poll::Ready(completion) => {
                self.deadlines.completed();
                Some(Completion {
                    data: completion.data,
                    status: completion.status.map_err(UsbError::from),
                })
            }
            Poll::Pending => None,
        }
    }

    fn pending(&self) -> usize {
        self.queue.pending()
    }

    fn cancel_all(&mut self) {
        self.queue.cancel_all();
        self.deadlines.cancelled();
    }
}

/// Scripted in-memory FX2 for tests.
///
/// The mock keeps a list of attached identifiers, an 8051 RAM image, a log of
/// successful control transfers and a script of bulk completions. Pending
/// bulk transfers stay pending until a completion is scripted for them.
///
/// Like usbfs, interface 0 stays claimed while either the handle or a bulk
/// queue created from it is alive, and a second open of the same identifiers
/// fails with a busy error.
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    use super::{BulkQueue, Completion, UsbBackend, UsbError, UsbHandle};
    use crate::protocol::{CpuState, UsbId, CPUCS_ADDR, REQUEST_RAM_ACCESS, REQUEST_START};

    const RAM_SIZE: usize = 0x10000;

    /// One scripted bulk completion
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockCompletion {
        /// Transfer returns these bytes (truncated to the requested length)
        Data(Vec<u8>),
        /// Transfer returns zero bytes
        Empty,
        /// Transfer fails
        Error(UsbError),
    }

    /// Successful control transfer seen by the mock
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ControlRecord {
        /// Device the transfer was sent to
        pub device: UsbId,
        /// `true` for host-to-device
        pub out: bool,
        /// bRequest
        pub request: u8,
        /// wValue
        pub value: u16,
        /// wIndex
        pub index: u16,
        /// Payload (OUT) or returned bytes (IN)
        pub data: Vec<u8>,
    }

    impl ControlRecord {
        /// RAM write, including CPUCS writes
        pub fn is_ram_write(&self) -> bool {
            self.out && self.request == REQUEST_RAM_ACCESS
        }

        /// CPU state written, if this is a CPUCS write
        pub fn cpu_state(&self) -> Option<CpuState> {
            if self.is_ram_write() && self.value == CPUCS_ADDR && self.data.len() == 1 {
                CpuState::try_from(self.data[0]).ok()
            } else {
                None
            }
        }

        /// Start-acquisition command
        pub fn is_start(&self) -> bool {
            self.out && self.request == REQUEST_START
        }
    }

    #[derive(Debug)]
    struct MockState {
        attached: Vec<UsbId>,
        reenumerate: Option<(UsbId, UsbId)>,
        fail_configuration: bool,
        fail_ram_write: Option<usize>,
        ram_writes: usize,
        fail_start: bool,
        ignore_cpu_state: bool,
        submission_limit: Option<usize>,
        submitted: usize,
        controls: Vec<ControlRecord>,
        ram: Vec<u8>,
        completions: VecDeque<MockCompletion>,
        claimed: Vec<UsbId>,
    }

    /// Interface claim, released when the last handle or queue holding it
    /// is dropped
    #[derive(Debug)]
    struct MockClaim {
        id: UsbId,
        state: Arc<Mutex<MockState>>,
    }

    impl Drop for MockClaim {
        fn drop(&mut self) {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .claimed
                .retain(|id| *id != self.id);
        }
    }

    /// Scripted USB backend; clones share the same device
    #[derive(Debug, Clone)]
    pub struct MockUsb {
        state: Arc<Mutex<MockState>>,
    }

    impl Default for MockUsb {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockUsb {
        /// Backend with nothing attached
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(MockState {
                    attached: Vec::new(),
                    reenumerate: None,
                    fail_configuration: false,
                    fail_ram_write: None,
                    ram_writes: 0,
                    fail_start: false,
                    ignore_cpu_state: false,
                    submission_limit: None,
                    submitted: 0,
                    controls: Vec::new(),
                    ram: vec![0; RAM_SIZE],
                    completions: VecDeque::new(),
                    claimed: Vec::new(),
                })),
            }
        }

        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Attach a device under `id`
        pub fn plug(&self, id: UsbId) {
            let mut state = self.state();
            if !state.attached.contains(&id) {
                state.attached.push(id);
            }
        }

        /// Detach every device
        pub fn unplug_all(&self) {
            self.state().attached.clear();
        }

        /// When the CPU is released from reset on `from`, the device
        /// disappears and comes back as `to`
        pub fn reenumerate_on_run(&self, from: UsbId, to: UsbId) {
            self.state().reenumerate = Some((from, to));
        }

        /// Make configuration/claim fail on every open
        pub fn fail_configuration(&self, fail: bool) {
            self.state().fail_configuration = fail;
        }

        /// Fail the `nth` RAM write (1-based, CPUCS writes included)
        pub fn fail_ram_write(&self, nth: usize) {
            self.state().fail_ram_write = Some(nth);
        }

        /// Acknowledge CPUCS writes without changing the CPU state
        pub fn ignore_cpu_state_writes(&self, ignore: bool) {
            self.state().ignore_cpu_state = ignore;
        }

        /// Make the start-acquisition command stall
        pub fn fail_start(&self, fail: bool) {
            self.state().fail_start = fail;
        }

        /// Refuse bulk submissions once `limit` have been accepted in total
        pub fn limit_submissions(&self, limit: Option<usize>) {
            self.state().submission_limit = limit;
        }

        /// Script the next bulk completion
        pub fn push_completion(&self, completion: MockCompletion) {
            self.state().completions.push_back(completion);
        }

        /// Script a bulk completion carrying `data`
        pub fn push_data(&self, data: Vec<u8>) {
            self.push_completion(MockCompletion::Data(data));
        }

        /// Scripted completions not yet consumed
        pub fn queued_completions(&self) -> usize {
            self.state().completions.len()
        }

        /// Successful control transfers, oldest first
        pub fn controls(&self) -> Vec<ControlRecord> {
            self.state().controls.clone()
        }

        /// Bulk submissions accepted so far
        pub fn submitted(&self) -> usize {
            self.state().submitted
        }

        /// Copy of the 8051 RAM image
        pub fn ram(&self) -> Vec<u8> {
            self.state().ram.clone()
        }

        /// Whether interface 0 of `id` is claimed
        pub fn is_claimed(&self, id: UsbId) -> bool {
            self.state().claimed.contains(&id)
        }
    }

    impl UsbBackend for MockUsb {
        type Handle = MockHandle;

        fn open(&self, id: UsbId) -> Result<MockHandle, UsbError> {
            let mut state = self.state();
            if !state.attached.contains(&id) {
                return Err(UsbError::NotFound);
            }
            if state.fail_configuration {
                return Err(UsbError::Io("set configuration failed".to_string()));
            }
            if state.claimed.contains(&id) {
                return Err(UsbError::Io("interface 0 busy".to_string()));
            }
            state.claimed.push(id);
            Ok(MockHandle {
                id,
                state: Arc::clone(&self.state),
                claim: Arc::new(MockClaim {
                    id,
                    state: Arc::clone(&self.state),
                }),
            })
        }
    }

    /// Opened mock device
    #[derive(Debug)]
    pub struct MockHandle {
        id: UsbId,
        state: Arc<Mutex<MockState>>,
        claim: Arc<MockClaim>,
    }

    impl MockHandle {
        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl UsbHandle for MockHandle {
        type Queue = MockQueue;

        fn id(&self) -> UsbId {
            self.id
        }

        fn control_out(
            &self,
            request: u8,
            value: u16,
            index: u16,
            data: &[u8],
            _timeout: Duration,
        ) -> Result<usize, UsbError> {
            let mut state = self.state();
            if !state.attached.contains(&self.id) {
                return Err(UsbError::Disconnected);
            }

            match request {
                REQUEST_RAM_ACCESS => {
                    state.ram_writes += 1;
                    if state.fail_ram_write == Some(state.ram_writes) {
                        return Err(UsbError::Stall);
                    }
                    let start = usize::from(value);
                    let end = (start + data.len()).min(RAM_SIZE);
                    if !(state.ignore_cpu_state && value == CPUCS_ADDR) {
                        state.ram[start..end].copy_from_slice(&data[..end - start]);
                    }

                    let released = value == CPUCS_ADDR && data.first() == Some(&0);
                    if released {
                        if let Some((from, to)) = state.reenumerate {
                            if from == self.id {
                                state.attached.retain(|id| *id != from);
                                if !state.attached.contains(&to) {
                                    state.attached.push(to);
                                }
                            }
                        }
                    }
                }
                REQUEST_START if state.fail_start => return Err(UsbError::Stall),
                _ => {}
            }

            state.controls.push(ControlRecord {
                device: self.id,
                out: true,
                request,
                value,
                index,
                data: data.to_vec(),
            });
            Ok(data.len())
        }

        fn control_in(
            &self,
            request: u8,
            value: u16,
            index: u16,
            len: usize,
            _timeout: Duration,
        ) -> Result<Vec<u8>, UsbError> {
            let mut state = self.state();
            if !state.attached.contains(&self.id) {
                return Err(UsbError::Disconnected);
            }

            let data = if request == REQUEST_RAM_ACCESS {
                let start = usize::from(value);
                let end = (start + len).min(RAM_SIZE);
                state.ram[start..end].to_vec()
            } else {
                Vec::new()
            };

            state.controls.push(ControlRecord {
                device: self.id,
                out: false,
                request,
                value,
                index,
                data: data.clone(),
            });
            Ok(data)
        }

        fn bulk_in_queue(&self, _endpoint: u8, _timeout: Duration) -> MockQueue {
            MockQueue {
                state: Arc::clone(&self.state),
                _claim: Arc::clone(&self.claim),
                pending: VecDeque::new(),
                draining: 0,
            }
        }
    }

    /// Mock bulk queue fed from the scripted completions
    #[derive(Debug)]
    pub struct MockQueue {
        state: Arc<Mutex<MockState>>,
        _claim: Arc<MockClaim>,
        pending: VecDeque<(Vec<u8>, usize)>,
        /// Cancelled transfers still to complete
        draining: usize,
    }

    impl BulkQueue for MockQueue {
        fn submit(&mut self, buf: Vec<u8>, len: usize) -> Result<(), UsbError> {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state
                .submission_limit
                .is_some_and(|limit| state.submitted >= limit)
            {
                return Err(UsbError::Io("submission refused".to_string()));
            }
            state.submitted += 1;
            self.pending.push_back((buf, len));
            Ok(())
        }

        fn poll_complete(&mut self) -> Option<Completion> {
            if self.draining > 0 {
                let (mut buf, _) = self.pending.pop_front()?;
                self.draining -= 1;
                buf.clear();
                return Some(Completion {
                    data: buf,
                    status: Err(UsbError::Cancelled),
                });
            }

            if self.pending.is_empty() {
                return None;
            }
            let scripted = self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .completions
                .pop_front()?;
            let (mut buf, len) = self.pending.pop_front()?;
            buf.clear();

            let status = match scripted {
                MockCompletion::Data(bytes) => {
                    buf.extend_from_slice(&bytes[..bytes.len().min(len)]);
                    Ok(())
                }
                MockCompletion::Empty => Ok(()),
                MockCompletion::Error(err) => Err(err),
            };
            Some(Completion { data: buf, status })
        }

        fn pending(&self) -> usize {
            self.pending.len()
        }

        fn cancel_all(&mut self) {
            self.draining = self.pending.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockCompletion, MockUsb};
    use super::*;
    use crate::protocol::{CpuState, CPUCS_ADDR, FX2_FIRMWARE_ID, FX2_STOCK_ID, REQUEST_RAM_ACCESS};

    const TIMEOUT: Duration = Duration::from_millis(10);

    #[test]
    fn test_transfer_error_mapping() {
        assert_eq!(UsbError::from(TransferError::Stall), UsbError::Stall);
        assert_eq!(UsbError::from(TransferError::Cancelled), UsbError::Cancelled);
        assert!(UsbError::from(TransferError::Disconnected).is_fatal());
        assert!(!UsbError::Stall.is_fatal());
    }

    #[test]
    fn test_mock_open() {
        let usb = MockUsb::new();
        assert_eq!(usb.open(FX2_STOCK_ID).unwrap_err(), UsbError::NotFound);

        usb.plug(FX2_STOCK_ID);
        assert_eq!(usb.open(FX2_STOCK_ID).unwrap().id(), FX2_STOCK_ID);

        usb.fail_configuration(true);
        assert!(matches!(usb.open(FX2_STOCK_ID), Err(UsbError::Io(_))));
    }

    #[test]
    fn test_mock_ram_and_reenumeration() {
        let usb = MockUsb::new();
        usb.plug(FX2_STOCK_ID);
        usb.reenumerate_on_run(FX2_STOCK_ID, FX2_FIRMWARE_ID);
        let handle = usb.open(FX2_STOCK_ID).unwrap();

        handle
            .control_out(REQUEST_RAM_ACCESS, 0x0010, 0, &[1, 2, 3], TIMEOUT)
            .unwrap();
        assert_eq!(
            handle.control_in(REQUEST_RAM_ACCESS, 0x0010, 0, 3, TIMEOUT).unwrap(),
            vec![1, 2, 3]
        );

        handle
            .control_out(REQUEST_RAM_ACCESS, CPUCS_ADDR, 0, &[0], TIMEOUT)
            .unwrap();
        assert_eq!(usb.open(FX2_STOCK_ID).unwrap_err(), UsbError::NotFound);
        usb.open(FX2_FIRMWARE_ID).unwrap();

        let controls = usb.controls();
        assert!(controls[0].is_ram_write());
        assert_eq!(controls[2].cpu_state(), Some(CpuState::Run));
    }

    #[test]
    fn test_mock_queue_script() {
        let usb = MockUsb::new();
        usb.plug(FX2_FIRMWARE_ID);
        let handle = usb.open(FX2_FIRMWARE_ID).unwrap();
        let mut queue = handle.bulk_in_queue(0x82, TIMEOUT);

        queue.submit(Vec::new(), 4).unwrap();
        queue.submit(Vec::new(), 4).unwrap();
        assert!(queue.poll_complete().is_none());

        usb.push_data(vec![9; 8]);
        usb.push_completion(MockCompletion::Error(UsbError::Stall));

        let first = queue.poll_complete().unwrap();
        assert_eq!(first.data, vec![9; 4]);
        first.status.unwrap();

        let second = queue.poll_complete().unwrap();
        assert_eq!(second.status, Err(UsbError::Stall));
        assert_eq!(queue.pending(), 0);
        assert_eq!(usb.submitted(), 2);
    }

    #[test]
    fn test_mock_cancel_and_limit() {
        let usb = MockUsb::new();
        usb.plug(FX2_FIRMWARE_ID);
        usb.limit_submissions(Some(2));
        let handle = usb.open(FX2_FIRMWARE_ID).unwrap();
        let mut queue = handle.bulk_in_queue(0x82, TIMEOUT);

        queue.submit(Vec::new(), 4).unwrap();
        queue.submit(Vec::new(), 4).unwrap();
        queue.submit(Vec::new(), 4).unwrap_err();

        queue.cancel_all();
        for _ in 0..2 {
            let done = queue.poll_complete().unwrap();
            assert_eq!(done.status, Err(UsbError::Cancelled));
        }
        assert!(queue.poll_complete().is_none());
    }

    #[test]
    fn test_mock_claim_outlives_handle() {
        let usb = MockUsb::new();
        usb.plug(FX2_FIRMWARE_ID);
        let handle = usb.open(FX2_FIRMWARE_ID).unwrap();
        assert_eq!(
            usb.open(FX2_FIRMWARE_ID).unwrap_err(),
            UsbError::Io("interface 0 busy".to_string())
        );

        // a live queue keeps the interface claimed
        let queue = handle.bulk_in_queue(0x82, TIMEOUT);
        drop(handle);
        assert!(usb.is_claimed(FX2_FIRMWARE_ID));
        usb.open(FX2_FIRMWARE_ID).unwrap_err();

        drop(queue);
        assert!(!usb.is_claimed(FX2_FIRMWARE_ID));
        usb.open(FX2_FIRMWARE_ID).unwrap();
    }

    #[test]
    fn test_deadline_fires_again_after_drain() {
        let timeout = Duration::from_millis(100);
        let mut deadlines = TransferDeadlines::new(timeout);
        let t0 = Instant::now();
        for _ in 0..4 {
            deadlines.submitted(t0);
        }
        assert!(!deadlines.expired(t0 + Duration::from_millis(50)));

        let t1 = t0 + timeout;
        assert!(deadlines.expired(t1));

        // each cancelled completion is resubmitted straight away, so the
        // queue never empties while the cancel drains
        for _ in 0..4 {
            assert!(!deadlines.expired(t1));
            deadlines.completed();
            deadlines.submitted(t1);
        }
        assert_eq!(deadlines.submitted_at.len(), 4);
        assert_eq!(deadlines.draining, 0);

        assert!(!deadlines.expired(t1 + Duration::from_millis(50)));
        assert!(deadlines.expired(t1 + timeout));
    }

    #[test]
    fn test_deadline_after_explicit_cancel() {
        let timeout = Duration::from_millis(100);
        let mut deadlines = TransferDeadlines::new(timeout);
        let t0 = Instant::now();
        deadlines.submitted(t0);
        deadlines.submitted(t0);

        deadlines.cancelled();
        assert!(!deadlines.expired(t0 + timeout));
        deadlines.completed();
        assert!(!deadlines.expired(t0 + timeout));
        deadlines.completed();

        deadlines.submitted(t0 + timeout);
        assert!(deadlines.expired(t0 + timeout * 2));
    }
}
