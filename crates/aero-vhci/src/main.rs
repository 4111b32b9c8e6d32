#![forbid(unsafe_code)]

//! Drives a virtual host controller against the in-process loopback device: powers and resets a
//! port, enumerates the device over the control pipe, then pushes data through its bulk echo
//! endpoints.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aero_vhci::loopback::{
    ChannelHost, HostEvent, LoopbackWorker, LOOPBACK_BULK_IN_EP, LOOPBACK_BULK_OUT_EP,
};
use aero_vhci::{
    feature, HubRequest, PortChange, PortStatus, SetupPacket, Transfer, TransferHandle,
    TransferStatus, Vhci, VhciConfig,
};
use anyhow::{bail, ensure, Context};
use clap::Parser;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);
const DEVICE_ADDRESS: u8 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "aero-vhci-loopback",
    about = "Enumerate and exercise an emulated loopback device through the virtual host controller."
)]
struct Args {
    /// Number of root-hub ports (overrides AERO_VHCI_PORTS)
    #[arg(long)]
    ports: Option<u8>,

    /// Root-hub port the loopback device is plugged into
    #[arg(long, default_value_t = 1)]
    port: u8,

    /// Number of bulk echo round trips
    #[arg(long, default_value_t = 4)]
    rounds: u32,

    /// Bytes per bulk echo round trip
    #[arg(long, default_value_t = 512)]
    chunk: u32,
}

/// The kernel-side half: issues hub requests and transfers and waits for the host callbacks.
struct Kernel {
    vhci: Vhci,
    events: Receiver<HostEvent>,
    port: u16,
}

impl Kernel {
    fn next_event(&self, deadline: Instant) -> anyhow::Result<HostEvent> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.events.recv_timeout(remaining) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => bail!("timed out waiting for the controller"),
            Err(RecvTimeoutError::Disconnected) => bail!("controller host channel closed"),
        }
    }

    /// Waits for a root-hub poll and returns the port status/change words.
    fn wait_port_change(&self, want: PortChange) -> anyhow::Result<(PortStatus, PortChange)> {
        let deadline = Instant::now() + EVENT_TIMEOUT;
        loop {
            let (status, change) = self.port_status()?;
            if change.contains(want) {
                return Ok((status, change));
            }
            match self.next_event(deadline)? {
                HostEvent::PollRootHub | HostEvent::ResumeRootHub => {}
                HostEvent::GiveBack { handle, .. } => {
                    bail!("unexpected give-back of {handle} while waiting for a port change")
                }
            }
        }
    }

    fn port_status(&self) -> anyhow::Result<(PortStatus, PortChange)> {
        let raw = self
            .vhci
            .hub_control(HubRequest::get_port_status(self.port))
            .context("GetPortStatus")?;
        ensure!(raw.len() == 4, "short port status");
        Ok((
            PortStatus::from_bits_retain(u16::from_le_bytes([raw[0], raw[1]])),
            PortChange::from_bits_retain(u16::from_le_bytes([raw[2], raw[3]])),
        ))
    }

    fn set_port_feature(&self, selector: u16) -> anyhow::Result<()> {
        self.vhci
            .hub_control(HubRequest::set_port_feature(self.port, selector))
            .with_context(|| format!("SetPortFeature({selector})"))?;
        Ok(())
    }

    fn clear_port_feature(&self, selector: u16) -> anyhow::Result<()> {
        self.vhci
            .hub_control(HubRequest::clear_port_feature(self.port, selector))
            .with_context(|| format!("ClearPortFeature({selector})"))?;
        Ok(())
    }

    /// Submits a transfer and waits for it to come back.
    fn transact(&self, transfer: Transfer) -> anyhow::Result<(Transfer, TransferStatus)> {
        let submitted = self.vhci.submit(transfer).context("submit")?;
        self.wait_give_back(submitted)
    }

    fn wait_give_back(&self, want: TransferHandle) -> anyhow::Result<(Transfer, TransferStatus)> {
        let deadline = Instant::now() + EVENT_TIMEOUT;
        loop {
            if let HostEvent::GiveBack {
                handle,
                transfer,
                status,
            } = self.next_event(deadline)?
            {
                ensure!(handle == want, "give-back for unexpected transfer {handle}");
                return Ok((transfer, status));
            }
        }
    }

    fn control(&self, address: u8, setup: SetupPacket) -> anyhow::Result<Vec<u8>> {
        let (transfer, status) = self.transact(Transfer::control(address, setup, None))?;
        ensure!(
            status == TransferStatus::Success,
            "control request {setup:?} failed: {status:?}"
        );
        let mut data = transfer.buffer.unwrap_or_default();
        data.truncate(transfer.actual_length as usize);
        Ok(data)
    }
}

fn enumerate(kernel: &Kernel) -> anyhow::Result<()> {
    kernel.set_port_feature(feature::PORT_POWER)?;
    let (status, _) = kernel.wait_port_change(PortChange::C_CONNECTION)?;
    tracing::info!(status = status.bits(), "device connected");
    kernel.clear_port_feature(feature::C_PORT_CONNECTION)?;

    kernel.set_port_feature(feature::PORT_RESET)?;
    let (status, _) = kernel.wait_port_change(PortChange::C_RESET)?;
    ensure!(
        status.contains(PortStatus::ENABLE),
        "port not enabled after reset"
    );
    kernel.clear_port_feature(feature::C_PORT_RESET)?;

    let descriptor = kernel.control(
        0,
        SetupPacket {
            bm_request_type: 0x80,
            b_request: 0x06,
            w_value: 0x0100,
            w_index: 0,
            w_length: 18,
        },
    )?;
    ensure!(descriptor.len() == 18, "short device descriptor");
    let vendor = u16::from_le_bytes([descriptor[8], descriptor[9]]);
    let product = u16::from_le_bytes([descriptor[10], descriptor[11]]);
    tracing::info!("device descriptor: {vendor:04x}:{product:04x}");

    kernel.control(
        0,
        SetupPacket {
            bm_request_type: 0x00,
            b_request: 0x05,
            w_value: u16::from(DEVICE_ADDRESS),
            w_index: 0,
            w_length: 0,
        },
    )?;
    kernel.control(
        DEVICE_ADDRESS,
        SetupPacket {
            bm_request_type: 0x00,
            b_request: 0x09,
            w_value: 1,
            w_index: 0,
            w_length: 0,
        },
    )?;
    tracing::info!(address = DEVICE_ADDRESS, "device configured");
    Ok(())
}

fn echo(kernel: &Kernel, rounds: u32, chunk: u32) -> anyhow::Result<u64> {
    let mut moved = 0u64;
    for round in 0..rounds {
        let data: Vec<u8> = (0..chunk).map(|i| (i + round) as u8).collect();
        let (sent, status) = kernel.transact(Transfer::bulk_out(
            DEVICE_ADDRESS,
            LOOPBACK_BULK_OUT_EP,
            data.clone(),
        ))?;
        ensure!(
            status == TransferStatus::Success && sent.actual_length == chunk,
            "bulk OUT failed: {status:?}"
        );

        let (received, status) = kernel.transact(Transfer::bulk_in(
            DEVICE_ADDRESS,
            LOOPBACK_BULK_IN_EP & 0x0f,
            chunk,
        ))?;
        ensure!(status == TransferStatus::Success, "bulk IN failed: {status:?}");
        let mut echoed = received.buffer.unwrap_or_default();
        echoed.truncate(received.actual_length as usize);
        ensure!(echoed == data, "echo mismatch in round {round}");
        moved += u64::from(chunk);
    }
    Ok(moved)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = VhciConfig::from_env().context("invalid config")?;
    if let Some(ports) = args.ports {
        config.port_count = ports;
    }
    ensure!(
        (1..=config.port_count).contains(&args.port),
        "port {} does not exist on a {}-port root hub",
        args.port,
        config.port_count
    );

    let (host, events) = ChannelHost::new();
    let vhci = Vhci::start(&config, Arc::new(host))?;
    let interrupt = vhci.new_interrupt();

    let worker = {
        let vhci = vhci.clone();
        let interrupt = interrupt.clone();
        let timeout = config.fetch_timeout();
        let port = args.port;
        thread::Builder::new()
            .name("vhci-worker".into())
            .spawn(move || {
                let mut worker = LoopbackWorker::new(port);
                worker.run(&vhci, timeout, &interrupt).map(|()| worker.transfers_served)
            })
            .context("spawn worker thread")?
    };

    let kernel = Kernel {
        vhci: vhci.clone(),
        events,
        port: u16::from(args.port),
    };
    let result = enumerate(&kernel).and_then(|()| echo(&kernel, args.rounds, args.chunk));

    interrupt.trigger();
    vhci.stop();
    let served = match worker.join() {
        Ok(served) => served?,
        Err(_) => bail!("worker thread panicked"),
    };

    let moved = result?;
    tracing::info!(served, moved, "loopback run complete");
    println!("loopback ok: {served} transfers served, {moved} bytes echoed");
    Ok(())
}
