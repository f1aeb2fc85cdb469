// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command-line client for the translation control device. It submits
//! requests against its own address space.

// UNSAFETY: Creating the local address space.
#![cfg_attr(target_os = "linux", expect(unsafe_code))]

mod tracing_init;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use serde::Serialize;
use v2p_defs::NtStatus;
use v2p_defs::INVALID_PHYSICAL_ADDRESS;
use v2p_defs::IOCTL_V2P_TRANSLATE;

#[derive(Parser)]
#[clap(about = "Translates virtual addresses of this process to physical addresses")]
struct Options {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translates freshly touched heap pages, plus any extra addresses.
    ///
    /// Physical addresses are only visible with CAP_SYS_ADMIN; otherwise
    /// every slot reports as invalid.
    Translate {
        /// The number of heap pages to allocate, touch, and translate.
        #[clap(long, default_value = "4")]
        pages: usize,
        /// An extra virtual address to translate, in hex.
        #[clap(long = "address", value_parser = parse_hex)]
        addresses: Vec<u64>,
        /// Output in JSON format.
        #[clap(long)]
        json: bool,
    },
    /// Prints the translate control code and its fields.
    IoctlCode,
}

fn parse_hex(s: &str) -> Result<u64, std::num::ParseIntError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16)
}

#[derive(Serialize)]
struct SlotReport {
    index: usize,
    virtual_address: String,
    physical_address: Option<String>,
}

#[derive(Serialize)]
struct TranslateReport {
    status: String,
    information: u64,
    valid: usize,
    slots: Vec<SlotReport>,
}

impl TranslateReport {
    fn new(status: NtStatus, information: u64, vas: &[u64], pas: &[u64]) -> Self {
        let slots: Vec<_> = vas
            .iter()
            .zip(pas)
            .enumerate()
            .map(|(index, (&va, &pa))| SlotReport {
                index,
                virtual_address: format!("{va:#x}"),
                physical_address: (pa != INVALID_PHYSICAL_ADDRESS).then(|| format!("{pa:#x}")),
            })
            .collect();
        let valid = slots
            .iter()
            .filter(|slot| slot.physical_address.is_some())
            .count();
        Self {
            status: status.to_string(),
            information,
            valid,
            slots,
        }
    }

    fn print(&self, json: bool) -> anyhow::Result<()> {
        if json {
            let out = serde_json::to_string_pretty(self).context("failed to serialize report")?;
            println!("{out}");
            return Ok(());
        }
        for slot in &self.slots {
            println!(
                "{:>4}  {:>18}  {}",
                slot.index,
                slot.virtual_address,
                slot.physical_address.as_deref().unwrap_or("invalid")
            );
        }
        println!(
            "{} of {} slots valid, {} bytes reported",
            self.valid,
            self.slots.len(),
            self.information
        );
        Ok(())
    }
}

/// Translates `pages` freshly touched heap pages followed by `addresses`.
#[cfg(target_os = "linux")]
fn translate_local(pages: usize, addresses: &[u64]) -> anyhow::Result<TranslateReport> {
    use parking_lot::Mutex;
    use std::sync::Arc;
    use v2p_core::ControlDevice;
    use v2p_core::LocalAddressSpace;
    use v2p_core::Request;
    use v2p_core::RequestParameters;
    use v2p_core::UserBuffer;

    // SAFETY: the buffers named by the request below are only read after it
    // completes.
    let space = unsafe { LocalAddressSpace::new() };
    let page_size = space.page_size() as usize;

    let mut scratch = vec![0u8; pages * page_size];
    for page in scratch.chunks_mut(page_size) {
        page[0] = 1;
    }

    let mut input = scratch
        .chunks(page_size)
        .map(|page| page.as_ptr() as usize)
        .collect::<Vec<_>>();
    for &address in addresses {
        input.push(
            usize::try_from(address)
                .with_context(|| format!("address {address:#x} does not fit a pointer"))?,
        );
    }
    let mut output = vec![0u64; input.len()];

    let completed = Arc::new(Mutex::new(None));
    let request = Request::new(
        RequestParameters::device_control(
            IOCTL_V2P_TRANSLATE,
            UserBuffer::from_slice(&input),
            UserBuffer::from_mut_slice(&mut output),
        ),
        {
            let completed = completed.clone();
            move |status: NtStatus, information: u64| {
                *completed.lock() = Some((status, information))
            }
        },
    );
    ControlDevice::new().io_in_caller_context(&space, request);

    let (status, information) = completed
        .lock()
        .take()
        .context("request was not completed")?;
    if !status.is_success() {
        anyhow::bail!("translation failed: {status}");
    }

    let vas: Vec<u64> = input.iter().map(|&va| va as u64).collect();
    let report = TranslateReport::new(status, information, &vas, &output);
    if report.information != (report.valid * size_of::<u64>()) as u64 {
        tracing::warn!(
            information = report.information,
            valid = report.valid,
            "reported byte count does not match valid slots"
        );
    }
    drop(scratch);
    Ok(report)
}

#[cfg(not(target_os = "linux"))]
fn translate_local(_pages: usize, _addresses: &[u64]) -> anyhow::Result<TranslateReport> {
    anyhow::bail!("translating local addresses is only supported on Linux")
}

fn translate(pages: usize, addresses: &[u64], json: bool) -> anyhow::Result<()> {
    translate_local(pages, addresses)?.print(json)
}

fn main() -> anyhow::Result<()> {
    tracing_init::enable_tracing()?;
    let options = Options::parse();
    match options.command {
        Command::Translate {
            pages,
            addresses,
            json,
        } => translate(pages, &addresses, json),
        Command::IoctlCode => {
            println!(
                "{:#010x} (device type {:#x}, function {:#x}, method {})",
                IOCTL_V2P_TRANSLATE,
                v2p_defs::ctl_device_type(IOCTL_V2P_TRANSLATE),
                v2p_defs::ctl_function(IOCTL_V2P_TRANSLATE),
                v2p_defs::ctl_method(IOCTL_V2P_TRANSLATE),
            );
            Ok(())
        }
    }
}
