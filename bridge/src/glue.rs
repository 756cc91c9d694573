//! # USB Callback Glue
//!
//! Routes USB stack events to the right component for the active
//! personality: CDC receive completions into the GDB channel or the UART
//! passthrough, vendor endpoint traffic into the DAP pipeline, line-state
//! changes into session tracking. The USB driver itself is external; it
//! reports events here and is driven back through [`VendorDriver`] and
//! [`TransportTx`].
//!
//! `dap_poll` is the consumer side of the DAP pipeline, called from the
//! probe task loop. It is gated on the GDB session not being network-active
//! per iteration; a session grabbed mid-execution lets the in-flight command
//! finish, which is harmless because the debugger host serializes its own
//! requests.

use std::sync::{Arc, Mutex, PoisonError};

use log::{error, info, warn};

use crate::channel::GdbChannel;
use crate::dap::{DapPipeline, SubmitOutcome, DAP_PACKET_SIZE};
use crate::personality::{CdcRole, Personality};
use crate::session::GdbSession;
use crate::traits::{DapInterpreter, LineCoding, NullStatus, StatusSink, UartPort, VendorDriver};

/// What to do when a CDC receive completion does not fit in the GDB queue.
///
/// With flow control working the queue never overflows, so losing bytes here
/// means silent RSP stream corruption. The probe treats that as fatal;
/// `Drop` exists for embeddings that prefer staying up over stream
/// integrity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxOverflowPolicy {
    #[default]
    Fatal,
    Drop,
}

type AbortHook = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Per-personality USB event router. Built once at USB init, then shared
/// with the driver callbacks and the probe task.
pub struct UsbGlue {
    personality: Personality,
    channel: Arc<GdbChannel>,
    dap: Arc<DapPipeline>,
    overflow_policy: RxOverflowPolicy,
    status: Box<dyn StatusSink>,
    uart: Option<Mutex<Box<dyn UartPort>>>,
    vendor: Option<Arc<dyn VendorDriver>>,
    abort_hook: Option<AbortHook>,
}

impl UsbGlue {
    pub fn new(personality: Personality, channel: Arc<GdbChannel>, dap: Arc<DapPipeline>) -> Self {
        Self {
            personality,
            channel,
            dap,
            overflow_policy: RxOverflowPolicy::default(),
            status: Box::new(NullStatus),
            uart: None,
            vendor: None,
            abort_hook: None,
        }
    }

    pub fn with_status_sink(mut self, status: Box<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    pub fn with_uart(mut self, uart: Box<dyn UartPort>) -> Self {
        self.uart = Some(Mutex::new(uart));
        self
    }

    pub fn with_vendor_driver(mut self, vendor: Arc<dyn VendorDriver>) -> Self {
        self.vendor = Some(vendor);
        self
    }

    pub fn with_overflow_policy(mut self, policy: RxOverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Hook invoked with the raw packet when `DAP_TransferAbort` arrives;
    /// runs in the receive completion context, ahead of queued commands.
    pub fn with_abort_hook(mut self, hook: AbortHook) -> Self {
        self.abort_hook = Some(hook);
        self
    }

    pub fn personality(&self) -> &Personality {
        &self.personality
    }

    /// Device configured by a host.
    pub fn on_mount(&self) {
        info!("USB mounted as {:?}", self.personality.mode());
        self.status.connected();
    }

    /// Device unmounted or bus lost: a USB GDB session cannot survive it.
    pub fn on_unmount(&self) {
        self.channel.session().deactivate(GdbSession::ActiveOverUsb);
        self.channel.wake_reader();
        self.status.disconnected();
        info!("USB unmounted");
    }

    /// CDC receive completion from the USB driver.
    pub fn on_cdc_rx(&self, itf: u8, bytes: &[u8]) {
        match self.personality.cdc_role(itf) {
            Some(CdcRole::Gdb) => {
                let accepted = self.channel.receive_from_isr(bytes);
                if accepted < bytes.len() {
                    match self.overflow_policy {
                        RxOverflowPolicy::Fatal => {
                            panic!("GDB rx queue overflow, RSP stream corrupt")
                        }
                        RxOverflowPolicy::Drop => {
                            warn!("GDB rx queue overflow, dropped {}", bytes.len() - accepted)
                        }
                    }
                }
            }
            Some(CdcRole::Uart) => {
                if let Some(uart) = &self.uart {
                    uart.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .write(bytes);
                }
            }
            None => warn!("rx on unmapped CDC interface {itf}"),
        }
    }

    /// Host changed line coding on a CDC interface; only the UART
    /// passthrough cares.
    pub fn on_cdc_line_coding(&self, itf: u8, coding: &LineCoding) {
        if self.personality.cdc_role(itf) == Some(CdcRole::Uart) {
            if let Some(uart) = &self.uart {
                uart.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .set_line_coding(coding);
            }
        }
    }

    /// Host toggled DTR/RTS. DTR on the GDB interface is the USB session
    /// signal: asserted means a debugger attached over CDC.
    pub fn on_cdc_line_state(&self, itf: u8, dtr: bool, rts: bool) {
        match self.personality.cdc_role(itf) {
            Some(CdcRole::Gdb) => {
                if dtr {
                    match self.channel.session().try_activate(GdbSession::ActiveOverUsb) {
                        Ok(()) => self.status.connected(),
                        Err(busy) => {
                            warn!("USB GDB attach refused, session {:?} active", busy.active)
                        }
                    }
                } else {
                    self.channel.session().deactivate(GdbSession::ActiveOverUsb);
                    self.channel.wake_reader();
                    self.status.disconnected();
                }
            }
            Some(CdcRole::Uart) => {
                if let Some(uart) = &self.uart {
                    uart.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .set_line_state(dtr, rts);
                }
            }
            None => {}
        }
    }

    /// Vendor OUT transfer completion. Queues the packet (or dispatches an
    /// abort) and re-arms the endpoint while the request ring has room.
    pub fn on_vendor_rx(&self, bytes: &[u8]) -> SubmitOutcome {
        let outcome = self.dap.submit_request(bytes);
        match outcome {
            SubmitOutcome::Queued => {}
            SubmitOutcome::Abort => {
                if let Some(hook) = &self.abort_hook {
                    hook(bytes);
                }
            }
            SubmitOutcome::Dropped => error!("DAP request dropped, ring full"),
        }
        self.rearm_out();
        outcome
    }

    /// Vendor IN transfer completion: chain the next queued response.
    pub fn on_vendor_tx_complete(&self) {
        self.pump_in();
    }

    /// USB bus reset: clear the DAP rings and release any USB GDB session.
    pub fn on_bus_reset(&self) {
        self.dap.bus_reset();
        self.channel.session().deactivate(GdbSession::ActiveOverUsb);
        self.channel.wake_reader();
    }

    /// One iteration of the DAP consumer. Returns true when a request was
    /// executed. Skipped entirely while a network GDB session owns the
    /// target.
    pub fn dap_poll(&self, interpreter: &mut dyn DapInterpreter) -> bool {
        if self.channel.session().is_network_active() {
            return false;
        }
        let Some(request) = self.dap.acquire_request() else {
            return false;
        };
        // No response slot: leave the request queued and retry next poll.
        let Some(mut response) = self.dap.acquire_response() else {
            return false;
        };

        let len = interpreter.process(&request, &mut response);
        response.commit(len);
        request.release();

        self.rearm_out();
        self.pump_in();
        true
    }

    fn rearm_out(&self) {
        if let Some(vendor) = &self.vendor {
            if vendor.out_idle() && self.dap.request_space() > 0 {
                vendor.arm_out();
            }
        }
    }

    fn pump_in(&self) {
        if let Some(vendor) = &self.vendor {
            if vendor.in_idle() {
                let mut buf = [0u8; DAP_PACKET_SIZE];
                if let Some(len) = self.dap.pop_transmission(&mut buf) {
                    vendor.transmit(&buf[..len]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap::{CMD_EXECUTE_COMMANDS, CMD_QUEUE_COMMANDS, CMD_TRANSFER_ABORT};
    use crate::personality::DeviceMode;
    use crate::session::SessionBusy;
    use crate::traits::TransportTx;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct NullTx;
    impl TransportTx for NullTx {
        fn send(&self, _data: &[u8], _flush: bool) {}
    }

    #[derive(Default)]
    struct MockVendor {
        out_armed: AtomicBool,
        in_busy: AtomicBool,
        transmitted: StdMutex<Vec<Vec<u8>>>,
    }

    impl VendorDriver for MockVendor {
        fn out_idle(&self) -> bool {
            !self.out_armed.load(Ordering::SeqCst)
        }

        fn arm_out(&self) {
            self.out_armed.store(true, Ordering::SeqCst);
        }

        fn in_idle(&self) -> bool {
            !self.in_busy.load(Ordering::SeqCst)
        }

        fn transmit(&self, data: &[u8]) {
            self.in_busy.store(true, Ordering::SeqCst);
            self.transmitted.lock().unwrap().push(data.to_vec());
        }
    }

    impl MockVendor {
        fn complete_in(&self) {
            self.in_busy.store(false, Ordering::SeqCst);
        }
    }

    /// Echoes the request with the command byte preserved and a marker
    /// appended.
    struct EchoInterp;

    impl DapInterpreter for EchoInterp {
        fn process(&mut self, request: &[u8], response: &mut [u8]) -> usize {
            response[..request.len()].copy_from_slice(request);
            response[request.len()] = 0xA5;
            request.len() + 1
        }
    }

    /// Records writes and line coding changes into shared cells so the test
    /// can inspect them behind the trait object.
    struct MockUart {
        written: Arc<StdMutex<Vec<Vec<u8>>>>,
        bit_rate: Arc<AtomicUsize>,
    }

    impl UartPort for MockUart {
        fn write(&mut self, data: &[u8]) {
            self.written.lock().unwrap().push(data.to_vec());
        }

        fn set_line_coding(&mut self, coding: &LineCoding) {
            self.bit_rate.store(coding.bit_rate as usize, Ordering::SeqCst);
        }
    }

    fn dual_cdc_glue() -> (UsbGlue, Arc<GdbChannel>) {
        let channel = Arc::new(GdbChannel::new(Arc::new(NullTx)));
        let glue = UsbGlue::new(
            Personality::select(DeviceMode::DualCdc),
            channel.clone(),
            Arc::new(DapPipeline::new()),
        );
        (glue, channel)
    }

    fn dap_link_glue(vendor: Arc<MockVendor>) -> (UsbGlue, Arc<GdbChannel>, Arc<DapPipeline>) {
        let channel = Arc::new(GdbChannel::new(Arc::new(NullTx)));
        let dap = Arc::new(DapPipeline::new());
        let glue = UsbGlue::new(
            Personality::select(DeviceMode::DapLink),
            channel.clone(),
            dap.clone(),
        )
        .with_vendor_driver(vendor);
        (glue, channel, dap)
    }

    #[test]
    fn gdb_cdc_rx_lands_in_channel() {
        let (glue, channel) = dual_cdc_glue();
        glue.on_cdc_rx(0, b"$g#67");
        assert_eq!(channel.getchar(), b'$');
    }

    #[test]
    fn uart_cdc_rx_and_line_coding_forward_to_port() {
        let written = Arc::new(StdMutex::new(Vec::new()));
        let bit_rate = Arc::new(AtomicUsize::new(0));
        let (glue, _channel) = dual_cdc_glue();
        let glue = glue.with_uart(Box::new(MockUart {
            written: written.clone(),
            bit_rate: bit_rate.clone(),
        }));

        glue.on_cdc_rx(1, b"boot log");
        assert_eq!(written.lock().unwrap().as_slice(), &[b"boot log".to_vec()]);

        glue.on_cdc_line_coding(
            1,
            &LineCoding {
                bit_rate: 115_200,
                stop_bits: crate::traits::StopBits::One,
                parity: crate::traits::Parity::None,
                data_bits: 8,
            },
        );
        assert_eq!(bit_rate.load(Ordering::SeqCst), 115_200);

        // GDB interface coding changes never reach the UART.
        glue.on_cdc_line_coding(
            0,
            &LineCoding {
                bit_rate: 9600,
                stop_bits: crate::traits::StopBits::One,
                parity: crate::traits::Parity::None,
                data_bits: 8,
            },
        );
        assert_eq!(bit_rate.load(Ordering::SeqCst), 115_200);
    }

    #[test]
    fn dtr_on_gdb_interface_tracks_usb_session() {
        #[derive(Default)]
        struct CountingStatus {
            connects: AtomicUsize,
            disconnects: AtomicUsize,
        }
        impl StatusSink for CountingStatus {
            fn connected(&self) {
                self.connects.fetch_add(1, Ordering::SeqCst);
            }
            fn disconnected(&self) {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            }
        }

        let status = Arc::new(CountingStatus::default());
        struct Fwd(Arc<CountingStatus>);
        impl StatusSink for Fwd {
            fn connected(&self) {
                self.0.connected()
            }
            fn disconnected(&self) {
                self.0.disconnected()
            }
        }

        let (glue, channel) = dual_cdc_glue();
        let glue = glue.with_status_sink(Box::new(Fwd(status.clone())));

        glue.on_cdc_line_state(0, true, false);
        assert_eq!(channel.session().current(), GdbSession::ActiveOverUsb);
        assert_eq!(status.connects.load(Ordering::SeqCst), 1);

        // A network claim must now be refused.
        assert_eq!(
            channel.session().try_activate(GdbSession::ActiveOverNetwork),
            Err(SessionBusy {
                active: GdbSession::ActiveOverUsb
            })
        );

        glue.on_cdc_line_state(0, false, false);
        assert!(channel.session().is_idle());
        assert_eq!(status.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "rx queue overflow")]
    fn fatal_policy_aborts_on_gdb_rx_overflow() {
        let (glue, _channel) = dual_cdc_glue();
        let flood = vec![b'x'; crate::GDB_RX_CAPACITY + 1];
        glue.on_cdc_rx(0, &flood);
    }

    #[test]
    fn drop_policy_sheds_overflow_bytes() {
        let (glue, channel) = dual_cdc_glue();
        let glue = glue.with_overflow_policy(RxOverflowPolicy::Drop);
        let flood = vec![b'x'; crate::GDB_RX_CAPACITY + 100];
        glue.on_cdc_rx(0, &flood);
        assert_eq!(channel.rx_free(), 0);
    }

    #[test]
    fn vendor_request_executes_and_transmits_response() {
        let vendor = Arc::new(MockVendor::default());
        let (glue, _channel, _dap) = dap_link_glue(vendor.clone());

        assert_eq!(glue.on_vendor_rx(&[0x02, 0x01]), SubmitOutcome::Queued);
        assert!(!vendor.out_idle(), "OUT endpoint must be re-armed");

        assert!(glue.dap_poll(&mut EchoInterp));
        assert_eq!(
            vendor.transmitted.lock().unwrap().as_slice(),
            &[vec![0x02, 0x01, 0xA5]]
        );
        assert!(!glue.dap_poll(&mut EchoInterp));
    }

    #[test]
    fn queued_group_executes_per_slot_after_terminator() {
        let vendor = Arc::new(MockVendor::default());
        let (glue, _channel, _dap) = dap_link_glue(vendor.clone());

        glue.on_vendor_rx(&[CMD_QUEUE_COMMANDS, 1]);
        glue.on_vendor_rx(&[CMD_QUEUE_COMMANDS, 2]);
        assert!(!glue.dap_poll(&mut EchoInterp), "incomplete batch must wait");

        glue.on_vendor_rx(&[CMD_EXECUTE_COMMANDS, 3]);
        for expected in [1u8, 2, 3] {
            vendor.complete_in();
            assert!(glue.dap_poll(&mut EchoInterp));
            let sent = vendor.transmitted.lock().unwrap();
            let last = sent.last().unwrap();
            assert_eq!(last[0], CMD_EXECUTE_COMMANDS);
            assert_eq!(last[1], expected);
        }
    }

    #[test]
    fn abort_invokes_hook_without_queueing() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let vendor = Arc::new(MockVendor::default());
        let (glue, _channel, dap) = dap_link_glue(vendor);
        let glue = glue.with_abort_hook(Box::new(move |packet| {
            seen2.lock().unwrap().push(packet.to_vec());
        }));

        assert_eq!(
            glue.on_vendor_rx(&[CMD_TRANSFER_ABORT, 0xDE]),
            SubmitOutcome::Abort
        );
        assert_eq!(seen.lock().unwrap().as_slice(), &[vec![CMD_TRANSFER_ABORT, 0xDE]]);
        assert!(dap.acquire_request().is_none());
    }

    #[test]
    fn dap_poll_is_gated_while_network_session_active() {
        let vendor = Arc::new(MockVendor::default());
        let (glue, channel, _dap) = dap_link_glue(vendor.clone());

        glue.on_vendor_rx(&[0x02]);
        channel
            .session()
            .try_activate(GdbSession::ActiveOverNetwork)
            .unwrap();
        assert!(!glue.dap_poll(&mut EchoInterp));
        assert!(vendor.transmitted.lock().unwrap().is_empty());

        channel.session().deactivate(GdbSession::ActiveOverNetwork);
        assert!(glue.dap_poll(&mut EchoInterp));
    }

    #[test]
    fn tx_complete_chains_queued_responses() {
        let vendor = Arc::new(MockVendor::default());
        let (glue, _channel, dap) = dap_link_glue(vendor.clone());

        // Two committed responses, IN endpoint busy with the first.
        glue.on_vendor_rx(&[0x02, 1]);
        glue.on_vendor_rx(&[0x02, 2]);
        assert!(glue.dap_poll(&mut EchoInterp));
        assert!(glue.dap_poll(&mut EchoInterp), "second executes while IN busy");
        assert_eq!(vendor.transmitted.lock().unwrap().len(), 1);
        assert!(dap.response_pending());

        vendor.complete_in();
        glue.on_vendor_tx_complete();
        assert_eq!(vendor.transmitted.lock().unwrap().len(), 2);
        assert!(!dap.response_pending());
    }

    #[test]
    fn unmount_releases_a_usb_session() {
        let (glue, channel) = dual_cdc_glue();
        glue.on_mount();
        glue.on_cdc_line_state(0, true, false);
        assert_eq!(channel.session().current(), GdbSession::ActiveOverUsb);

        glue.on_unmount();
        assert!(channel.session().is_idle());
    }

    #[test]
    fn bus_reset_clears_rings_and_usb_session() {
        let vendor = Arc::new(MockVendor::default());
        let (glue, channel, dap) = dap_link_glue(vendor);
        glue.on_vendor_rx(&[CMD_QUEUE_COMMANDS, 1]);
        channel.session().try_activate(GdbSession::ActiveOverUsb).unwrap();

        glue.on_bus_reset();
        assert!(channel.session().is_idle());
        assert_eq!(dap.request_space(), crate::DAP_PACKET_COUNT);
    }
}
