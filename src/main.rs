#![cfg_attr(not(any(test, feature = "host-test")), no_std)]
#![cfg_attr(feature = "target", no_main)]

//! Entry point: wires the pure-logic modules below to the board's CAN,
//! UART, servo-pulse and bus-voltage/current/temperature peripherals under
//! an RTIC 2 app. Peripheral register access is confined to the `target`
//! feature; everything it calls into is exercised directly under
//! `host-test` with no hardware at all.

#[cfg(any(test, feature = "host-test"))]
extern crate std;

mod can;
mod command;
mod controller;
mod fault;
mod fixed;
mod hbridge;
mod limits;
mod link;
mod message;
mod param;
mod pid;
mod sensors;
mod servo;
mod setpoint;
mod uart;

/// Nominal control-loop rate (spec.md §5): every module that counts ticks
/// (fault hold-off, assignment timeout, periodic status, link watchdogs) is
/// defined in units of this rate.
pub const TICK_HZ: u32 = 1000;

#[cfg(feature = "target")]
#[rtic::app(device = pac, peripherals = true, dispatchers = [EXTI9_5])]
mod app {
    use cfg_if::cfg_if;
    use cortex_m::asm;
    use defmt_rtt as _;
    use fdcan::frame::{FrameFormat, TxFrameHeader};
    use fdcan::id::{ExtendedId, Id};
    use panic_probe as _;

    use crate::can::{self, CanInterface};
    use crate::command;
    use crate::controller::Controller;
    use crate::fault::FaultKind;
    use crate::fault::FaultState;
    use crate::hbridge::HBridge;
    use crate::limits::Limits;
    use crate::link::{LinkKind, LinkWatchdog};
    use crate::param::{ParamBlock, ParamError, ParamStore, Params, RingParamStore};
    use crate::message::Message;
    use crate::sensors::Sensors;
    use crate::servo::{PulseResult, Servo, ServoWidths};
    use crate::uart::{self, Decoder, TxRing};

    cfg_if! {
        if #[cfg(feature = "h7")] {
            use hal::pac;
        } else if #[cfg(feature = "g4")] {
            use hal::pac;
        }
    }

    /// Output-duty bound matches `HBridge::voltage_max`; both are expressed
    /// in the same duty units as the Voltage setpoint (spec.md §4.2).
    const OUTPUT_BOUND: i32 = 10_000;

    /// Flash-backed parameter store on target. The concrete flash sector
    /// layout is board-specific and out of scope (spec.md §1); this wraps
    /// whatever region `init` hands it once wired.
    pub struct FlashParamStore;

    impl ParamStore for FlashParamStore {
        fn load(&mut self) -> Option<ParamBlock> {
            // Until a board's flash region is wired, behave as an erased
            // device and fall back to `ParamBlock::default()`, matching
            // `RingParamStore`'s own "no valid block yet" behavior.
            None
        }

        fn save(&mut self, _block: &ParamBlock) -> Result<(), ParamError> {
            Err(ParamError::WriteFailed)
        }
    }

    #[shared]
    struct Shared {
        controller: Controller,
        message: Message,
        params: Params<RingParamStore<2>>,
        can_if: CanInterface,
        servo: Servo,
        link: LinkWatchdog,
    }

    #[local]
    struct Local {
        uart_decoder: Decoder,
        uart_tx: TxRing,
        tick: u32,
    }

    #[init]
    fn init(_cx: init::Context) -> (Shared, Local, init::Monotonics) {
        defmt::println!("jaguar-mc: init");

        let params = Params::new(RingParamStore::<2>::new());
        let block = *params.block();

        let mut faults = FaultState::new(super::TICK_HZ / 100);
        // Communication starts absent until the first link goes good, per
        // spec.md §4.5's boot-time behavior; seed the fault immediately
        // rather than waiting a full hold-off.
        faults.update(FaultKind::Communication, true);

        let controller = Controller::new(
            HBridge::new(OUTPUT_BOUND as u16, false),
            Sensors::new(super::TICK_HZ),
            Limits::new(),
            faults,
            OUTPUT_BOUND,
        );

        let message = Message::new(block.device_number);

        let servo = Servo::new(ServoWidths {
            negative: block.servo_negative_width,
            neutral: block.servo_neutral_width,
            positive: block.servo_positive_width,
        });

        let deadline = super::TICK_HZ / 4; // 250 ms, per spec.md §4.5's watchdog note.
        let link = LinkWatchdog::new([deadline, deadline, deadline]);

        (
            Shared {
                controller,
                message,
                params,
                can_if: CanInterface::new(),
                servo,
                link,
            },
            Local {
                uart_decoder: Decoder::new(),
                uart_tx: TxRing::new(),
                tick: 0,
            },
            init::Monotonics(),
        )
    }

    #[idle]
    fn idle(_cx: idle::Context) -> ! {
        loop {
            asm::wfi();
        }
    }

    /// 1 kHz control tick (spec.md §5): runs the regulator, advances the
    /// assignment and periodic-status timers, and re-evaluates which link
    /// currently owns the command stream.
    #[task(
        binds = TIM7,
        shared = [controller, message, can_if, link],
        local = [tick],
        priority = 4
    )]
    fn control_tick(cx: control_tick::Context) {
        let control_tick::SharedResources {
            mut controller,
            mut message,
            mut can_if,
            mut link,
        } = cx.shared;
        let tick = cx.local.tick;
        *tick = tick.wrapping_add(1);
        let now = *tick;

        let all_lost = link.lock(|link| link.tick(now));
        controller.lock(|controller| {
            controller
                .faults_mut()
                .update(FaultKind::Communication, all_lost);
            controller.tick();
        });

        if let Some(_signal) = message.lock(|message| message.tick_assign()) {
            // UI LED pattern dispatch lives in out-of-scope GPIO code; the
            // signal is available here for whichever board wiring consumes
            // it.
        }

        let replies = (&mut controller, &mut message, &mut can_if).lock(
            |controller, message, can_if| message.tick_pstat(controller, can_if.status()),
        );
        can_if.lock(|can_if| {
            for reply in replies.iter() {
                can_if.stage(reply);
            }
            if let Some(id) = can_if.tick_enumerate() {
                can_if.stage(&crate::message::Reply {
                    id,
                    payload: Default::default(),
                });
            }
        });
    }

    /// Servo pulse edge capture (input-capture channel, board-specific pin
    /// assignment out of scope per spec.md §1). Width/period measurement
    /// hardware is elided; this task's job is only to route a measured
    /// pulse into `Servo::on_pulse` and, on a valid command, into the
    /// Voltage setpoint via the active-link gate.
    #[task(
        binds = TIM3,
        shared = [servo, link, controller],
        priority = 3
    )]
    fn servo_edge(cx: servo_edge::Context) {
        let servo_edge::SharedResources {
            mut servo,
            mut link,
            mut controller,
        } = cx.shared;

        // Width/period come from the input-capture peripheral's last two
        // compare values; left as a placeholder pair until that register
        // access is wired for the target board.
        let width: u32 = 1500;
        let period: u32 = 20_000;

        match servo.lock(|servo| servo.on_pulse(width, period)) {
            PulseResult::LinkLost => {}
            PulseResult::Calibrating => {}
            PulseResult::Command(cmd) => {
                link.lock(|link| link.mark_good(LinkKind::Servo, 0));
                if link.lock(|link| link.active()) == Some(LinkKind::Servo) {
                    controller.lock(|controller| {
                        let _ = command::set_voltage(controller, cmd);
                    });
                }
            }
        }
    }

    /// FDCAN RX FIFO 0 new-message interrupt: pulls one frame, matches it
    /// against the slot table, and hands it to the Message dispatcher.
    #[task(
        binds = FDCAN1_IT0,
        shared = [can_if, message, controller, params, link],
        priority = 5
    )]
    fn can_rx(cx: can_rx::Context) {
        let can_rx::SharedResources {
            mut can_if,
            mut message,
            mut controller,
            mut params,
            mut link,
        } = cx.shared;

        // Draining the FDCAN peripheral's RX FIFO into `can::RxFrame` is
        // board-specific register access, out of scope per spec.md §1; a
        // concrete board wires that read here and calls the dispatch below
        // per frame received.
        let frame: Option<can::RxFrame> = None;

        if let Some(frame) = frame {
            let device_number = message.lock(|m| m.device_number());
            if can::match_rx_slot(frame.id, device_number).is_some() {
                link.lock(|link| link.mark_good(LinkKind::Can, 0));
                let reply = (&mut controller, &mut params).lock(|controller, params| {
                    message.lock(|message| {
                        message.handle_frame(controller, params, frame.id, frame.payload())
                    })
                });
                if let Some(reply) = reply {
                    can_if.lock(|can_if| can_if.stage(&reply));
                }
            }
        }
    }

    /// FDCAN TX-complete interrupt: pulls the next staged frame and hands it
    /// to the peripheral, or back onto the retry queue on failure.
    #[task(binds = FDCAN1_IT1, shared = [can_if], priority = 5)]
    fn can_tx(cx: can_tx::Context) {
        let mut can_if = cx.shared.can_if;
        can_if.lock(|can_if| {
            if let Some(frame) = can_if.poll_tx() {
                let header = TxFrameHeader {
                    len: frame.len,
                    frame_format: FrameFormat::Standard,
                    id: Id::Extended(ExtendedId::new(frame.id).unwrap_or(ExtendedId::ZERO)),
                    bit_rate_switching: false,
                    marker: None,
                };
                // Actual peripheral transmit call and its failure path are
                // out of scope; on a real board a failed `transmit` call
                // routes back through `can_if.tx_failed(frame)`.
                let _ = header;
            }
        });
    }

    /// USART RX interrupt: feeds one byte into the framing decoder; a
    /// completed packet is bridged to CAN or dispatched locally per
    /// spec.md §4.8.
    #[task(
        binds = USART2,
        shared = [message, controller, params, can_if, link],
        local = [uart_decoder],
        priority = 4
    )]
    fn uart_rx(cx: uart_rx::Context) {
        let uart_rx::SharedResources {
            mut message,
            mut controller,
            mut params,
            mut can_if,
            mut link,
        } = cx.shared;
        let decoder = cx.local.uart_decoder;

        // Reading the received byte off the USART data register is
        // board-specific and out of scope; real bytes arrive here one at a
        // time from that ISR.
        let byte: Option<u8> = None;

        let Some(byte) = byte else { return };
        let Some(payload) = decoder.push_byte(byte) else {
            return;
        };
        let Some((id, body)) = uart::split_id(&payload) else {
            return;
        };

        link.lock(|link| link.mark_good(LinkKind::Uart, 0));

        let device_number = message.lock(|m| m.device_number());
        let dest = crate::can::id::CanId::decode(id).device_number;
        if matches!(
            uart::bridge_decision(dest, device_number),
            uart::BridgeDecision::Bridge
        ) {
            can_if.lock(|can_if| {
                can_if.stage(&crate::message::Reply {
                    id,
                    payload: body.iter().copied().collect(),
                });
            });
        }
        if dest == device_number || dest == 0 {
            let reply = (&mut controller, &mut params).lock(|controller, params| {
                message.lock(|message| message.handle_frame(controller, params, id, body))
            });
            if let Some(reply) = reply {
                if let Some(frame) = uart::encode(reply.id, &reply.payload) {
                    // Staging into the TX ring is owned by the task that
                    // drains it on a real board's split TX/RX interrupt
                    // pair; left as a wiring note here.
                    let _ = frame;
                }
            }
        }
    }
}

#[cfg(not(feature = "target"))]
fn main() {}
