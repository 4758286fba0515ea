use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use lumen8::nes::Nes;
use lumen8::nes::config::NesConfig;

const MASK_SHOW_BACKGROUND_AND_SPRITES: u8 = 0x1E;
const CTRL_NMI_ENABLE: u8 = 0x80;

#[derive(Debug)]
struct Options {
    rom: PathBuf,
    frames: u32,
    config: Option<PathBuf>,
    dump_trace: bool,
}

fn usage() -> &'static str {
    "Usage: lumen8_probe <rom.nes> [--frames N] [--config console.json] [--trace]"
}

fn parse_args() -> Result<Options> {
    let mut args = std::env::args().skip(1);
    let mut rom = None;
    let mut frames = 1;
    let mut config = None;
    let mut dump_trace = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames" => {
                let value = args.next().context("--frames needs a value")?;
                frames = value
                    .parse()
                    .with_context(|| format!("invalid frame count: {value}"))?;
            }
            "--config" => {
                config = Some(PathBuf::from(
                    args.next().context("--config needs a path")?,
                ));
            }
            "--trace" => dump_trace = true,
            "-h" | "--help" => bail!(usage()),
            _ if rom.is_none() => rom = Some(PathBuf::from(arg)),
            other => bail!("unexpected argument: {other}\n{}", usage()),
        }
    }

    let Some(rom) = rom else {
        bail!(usage());
    };
    Ok(Options {
        rom,
        frames,
        config,
        dump_trace,
    })
}

fn main() -> Result<()> {
    let options = parse_args()?;
    let config = match options.config.as_deref() {
        Some(path) => NesConfig::from_file(path)?,
        None => NesConfig::default(),
    };

    let mut nes = Nes::new(config);
    nes.load_rom_from_path(&options.rom)
        .with_context(|| format!("failed to load {}", options.rom.display()))?;

    println!("ROM: {}", options.rom.display());
    println!("Mapper: {}", nes.mapper_name());

    // No instruction core drives the bus, so turn the picture on directly.
    nes.cpu_write(0x2000, CTRL_NMI_ENABLE);
    nes.cpu_write(0x2001, MASK_SHOW_BACKGROUND_AND_SPRITES);

    // Touch the reset vector so the trace has something to show.
    let vector = u16::from_le_bytes([nes.cpu_read(0xFFFC), nes.cpu_read(0xFFFD)]);
    let entry = nes.trace_fetch(vector);
    println!(
        "Reset vector: ${vector:04X} opcode=${:02X} bank_epoch={}",
        entry.opcode, entry.bank_epoch
    );

    for _ in 0..options.frames {
        nes.run_frame();
        if nes.take_nmi() {
            // Reading status acknowledges vblank the way a handler would.
            nes.cpu_read(0x2002);
        }
    }

    let ppu = nes.ppu();
    let counters = nes.debug_counters();
    println!();
    println!("Frames presented: {}", nes.frame_buffer().frames_presented());
    println!("CPU cycles: {}", nes.total_cycles());
    println!(
        "PPU: scanline={} cycle={} ctrl=${:02X} mask=${:02X} status=${:02X} v=${:04X} t=${:04X}",
        ppu.scanline(),
        ppu.cycle(),
        ppu.debug_ctrl(),
        ppu.debug_mask(),
        ppu.debug_status(),
        ppu.vram_addr(),
        ppu.temp_addr()
    );
    println!(
        "Interrupts: nmi_raised={} irq_raised={} irq_line={} mapper_irq={}",
        counters.nmi_raised,
        counters.irq_raised,
        nes.irq_line(),
        nes.mapper().is_some_and(|mapper| mapper.irq_asserted())
    );
    println!("Mapper state: {}", nes.debug_mapper_state());
    println!("Frame SHA-1: {}", nes.frame_buffer().digest_base64());

    let snapshot = nes.save_state()?;
    println!(
        "Snapshot ({} bytes): {}",
        snapshot.len(),
        BASE64_STANDARD.encode(&snapshot)
    );

    println!();
    println!("Recent events:");
    for event in nes.debug_recent_events(8) {
        println!("  {event}");
    }

    if options.dump_trace {
        println!();
        print!("{}", nes.trace().to_json_lines()?);
    }

    Ok(())
}
