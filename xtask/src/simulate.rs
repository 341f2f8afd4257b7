use anyhow::{anyhow, bail, Result};
use colored::Colorize;
use std::time::Instant;

use overlay::{
    ClassLayout, DmaConfig, DmaLock, LoadError, MemClass, MissOutcome, OverlayConfig,
    OverlayDescriptor, OverlayOp, OverlaySystem, OverlayTable, OvlSize, SecureImage,
    TaskOverlays,
};
use platform::sim::{SimDmem, SimExternal, SimFalcon, SimImem, SimLayout, SimScheduler};
use platform::{DmemTagMemory, TagMemory};
use tracing_subscriber::EnvFilter;

const TASKS: usize = 4;
const CODE_OVERLAYS: u8 = 8;
const DATA_OVERLAYS: u8 = 6;
const ENC_OFFSET: u32 = 0x4_0000;

/// Deterministic xorshift generator so a seed reproduces a run.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }

    fn chance(&mut self, percent: u64) -> bool {
        self.below(100) < percent
    }
}

#[derive(Default)]
struct Counters {
    loads: u32,
    blocks: u32,
    deferred: u32,
    batches: u32,
    rollbacks: u32,
    misses: u32,
    suspensions: u32,
}

fn byte(addr: u64) -> u8 {
    (addr ^ (addr >> 8) ^ 0x5A) as u8
}

fn seed(external: &SimExternal, layout: &SimLayout) {
    let code: Vec<u8> = (0..0x1_0000u64).map(byte).collect();
    external.write(layout.imem_image_base(), &code);
    // Encrypted copy: a distinct pattern so misrouted secure reads show up.
    let enc: Vec<u8> = code.iter().map(|b| !b).collect();
    external.write(layout.imem_image_base() + u64::from(ENC_OFFSET), &enc);
    let data: Vec<u8> = (0..0x4000u64)
        .map(|i| byte(u64::from(layout.dmem_va_base) + i))
        .collect();
    external.write(layout.dmem_image_base(), &data);
}

fn config(layout: &SimLayout, on_demand: bool) -> OverlayConfig {
    OverlayConfig {
        block_shift: layout.block_shift,
        imem: ClassLayout {
            block_count: layout.imem_blocks,
            first_pageable: 2,
            va_base: 0,
        },
        dmem: ClassLayout {
            block_count: layout.dmem_blocks,
            first_pageable: layout.dmem_resident_blocks,
            va_base: layout.dmem_va_base,
        },
        dma: DmaConfig::falcon_default(),
        on_demand_paging: on_demand,
        secure_overlays: true,
    }
}

fn code_size(n: u8) -> OvlSize {
    0x100 * (1 + OvlSize::from(n) % 3)
}

/// Resident kernel code plus code overlays of one to three blocks, the last
/// one HS. Overlay `n` starts at `0x1000 * n`.
fn code_table(shift: u8) -> Result<OverlayTable> {
    let mut descriptors = vec![OverlayDescriptor::resident(0, 0x200, 0x200)];
    for n in 1..CODE_OVERLAYS {
        let size = code_size(n);
        let desc = OverlayDescriptor::paged(0x1000 * u32::from(n), size, size);
        descriptors.push(if n == CODE_OVERLAYS - 1 {
            desc.with_secure(SecureImage {
                enc_offset_debug: ENC_OFFSET,
                enc_offset_prod: ENC_OFFSET,
            })
        } else {
            desc
        });
    }
    OverlayTable::new(&descriptors, shift).map_err(|e| anyhow!("code table: {e}"))
}

/// Resident heap, then paged data overlays; the first paged one receives
/// the boot DMA buffer, the last one holds task stacks.
fn data_table(shift: u8, va_base: u32) -> Result<OverlayTable> {
    // The OS heap starts empty and grows by bump allocation at boot.
    let mut descriptors = vec![OverlayDescriptor::resident(0, 0, 0x200)];
    let mut start = va_base;
    for n in 1..DATA_OVERLAYS {
        let (current, max) = match n {
            1 => (0, 0x400),
            n if n == DATA_OVERLAYS - 1 => (0, 0x400),
            _ => (0x200, 0x300),
        };
        descriptors.push(OverlayDescriptor::paged(start, current, max));
        start += u32::from(max);
    }
    let table = OverlayTable::new(&descriptors, shift).map_err(|e| anyhow!("data table: {e}"))?;
    let heap = table.index(1).ok_or_else(|| anyhow!("data table: no heap entry"))?;
    table.with_heap(heap).map_err(|e| anyhow!("data table: {e}"))
}

type Sim<'a> = OverlaySystem<'a, SimImem, SimDmem>;

/// Every resident code block of `task` must match the image it came from.
fn verify_code(sys: &Sim<'_>, task: &TaskOverlays) -> Result<()> {
    let table = sys.table(MemClass::Imem);
    let shift = sys.config().block_shift;
    let lists = [(task.imem_list(), false), (task.hs_list(), true)];
    for (list, secure) in lists {
        for ovl in list.iter().flatten() {
            if table.get(*ovl).is_some_and(|d| d.resident) {
                continue;
            }
            for vtag in table.virtual_span(*ovl, shift) {
                let word = sys.imem_hw().lookup(vtag);
                if !word.is_valid() {
                    bail!("overlay {} tag {:#x} not resident after load", ovl.get(), vtag);
                }
                let start = u64::from(vtag) << shift;
                let block = sys.imem_hw().block_bytes(word.index());
                let intact = block.iter().enumerate().all(|(i, b)| {
                    let plain = byte(start + i as u64);
                    *b == if secure { !plain } else { plain }
                });
                if !intact {
                    bail!("overlay {} tag {:#x} holds the wrong image", ovl.get(), vtag);
                }
            }
        }
    }
    Ok(())
}

fn random_batch(rng: &mut Rng) -> Vec<OverlayOp> {
    let len = 1 + rng.below(4) as usize;
    (0..len)
        .map(|_| {
            let attach = rng.chance(60);
            if rng.chance(50) {
                let index = 1 + rng.below(u64::from(CODE_OVERLAYS - 2)) as u8;
                if attach {
                    OverlayOp::attach(index, MemClass::Imem)
                } else {
                    OverlayOp::detach(index, MemClass::Imem)
                }
            } else {
                let index = 2 + rng.below(u64::from(DATA_OVERLAYS - 3)) as u8;
                if attach {
                    OverlayOp::attach(index, MemClass::Dmem)
                } else {
                    OverlayOp::detach(index, MemClass::Dmem)
                }
            }
        })
        .collect()
}

pub fn run(rounds: u32, on_demand: bool, seed_value: u64) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("overlay=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    println!();
    println!("{}", "🧠 Simulating overlay paging...".cyan().bold());
    println!(
        "   {} rounds, {} replacement, seed {}",
        rounds,
        if on_demand { "round-robin" } else { "MRU" },
        seed_value
    );
    println!();

    let start = Instant::now();
    let layout = SimLayout::small();
    let core = SimFalcon::new(layout);
    seed(&core.external, &layout);

    let lock = DmaLock::new();
    let cfg = config(&layout, on_demand);
    let mut sys = OverlaySystem::new(
        cfg,
        core.imem,
        core.dmem,
        code_table(cfg.block_shift)?,
        data_table(cfg.block_shift, cfg.dmem.va_base)?,
        &lock,
    )
    .map_err(|e| anyhow!("overlay system: {e}"))?;

    // ── Boot ────────────────────────────────────────────────────────────────
    let heap = sys.table(MemClass::Dmem).index(1).ok_or_else(|| anyhow!("no heap"))?;
    let buffers = sys.table(MemClass::Dmem).index(2).ok_or_else(|| anyhow!("no buffers"))?;
    let stacks = sys
        .table(MemClass::Dmem)
        .index(DATA_OVERLAYS)
        .ok_or_else(|| anyhow!("no stack overlay"))?;
    let tcb_base = sys.alloc_resident(TASKS * 32, 16)?;
    let dma_buffer = sys.calloc_aligned(buffers, 0x180, 64)?;
    let stack = sys.setup_stack(stacks)?;
    sys.block_allocations();
    println!(
        "   TCBs at {:#x}, DMA buffer at {:#x}, stack {:#x} ({} words), heap left {} bytes",
        tcb_base,
        dma_buffer,
        stack.base,
        stack.depth,
        sys.free_bytes(heap)
    );

    let mut rng = Rng(seed_value.max(1));
    let mut sched = SimScheduler::new();
    let mut tasks: Vec<TaskOverlays> = (0..TASKS).map(|_| TaskOverlays::new(3, 1, 3)).collect();
    // Table index of the HS overlay: one past the resident kernel entry.
    let hs = CODE_OVERLAYS;
    if let Some(first) = tasks.first_mut() {
        sys.attach_or_halt(first, hs, MemClass::Imem, true);
    }

    let mut counters = Counters::default();
    let mut current: Option<usize> = None;
    let mut suspended_until: Option<u32> = None;

    for round in 0..rounds {
        if suspended_until == Some(round) {
            lock.resume();
            suspended_until = None;
        } else if suspended_until.is_none() && rng.chance(5) && lock.suspend(false).granted() {
            counters.suspensions += 1;
            suspended_until = Some(round + 1 + rng.below(3) as u32);
        }

        let pick = rng.below(TASKS as u64) as usize;
        if rng.chance(30) {
            counters.batches += 1;
            if let Some(task) = tasks.get_mut(pick) {
                if !sys.exec_descriptor_list(task, &random_batch(&mut rng), &mut sched) {
                    counters.rollbacks += 1;
                }
            }
        }

        let Some(task) = tasks.get_mut(pick) else {
            continue;
        };
        match sys.load_task(task, current == Some(pick)) {
            Ok(blocks) => {
                counters.loads += 1;
                counters.blocks += blocks;
                current = Some(pick);
                // Round-robin misses may steal a current task's blocks
                // between loads; only LRU replacement keeps them pinned.
                if !on_demand {
                    verify_code(&sys, task)?;
                }
                if let Some(ovl) = task.dmem_list().iter().flatten().next() {
                    let desc = sys.table(MemClass::Dmem).get(*ovl).copied();
                    if let Some(desc) = desc.filter(|d| d.size_current > 0) {
                        sys.dmem_hw_mut()
                            .write_bytes(desc.virtual_start, &round.to_le_bytes())
                            .map_err(|f| anyhow!("store to loaded overlay missed at {f}"))?;
                    }
                }
            }
            Err(LoadError::Suspended) => counters.deferred += 1,
        }

        if on_demand {
            let n = 1 + rng.below(u64::from(CODE_OVERLAYS - 2)) as u8;
            let pc = (0x1000 * u32::from(n) + rng.below(u64::from(code_size(n))) as u32) & !3;
            if !sys.imem_hw().lookup(pc >> cfg.block_shift).is_valid() {
                if let MissOutcome::Loaded { .. } = sys.imem_handle_miss(pc) {
                    counters.misses += 1;
                }
            }
        }
    }
    if suspended_until.is_some() {
        lock.resume();
    }

    let imem = sys.imem_hw().stats();
    let dmem = sys.dmem_hw().stats();
    println!("   task loads        {:>6} ({} blocks)", counters.loads, counters.blocks);
    println!("   deferred loads    {:>6}", counters.deferred);
    println!("   DMA suspensions   {:>6}", counters.suspensions);
    println!("   batches           {:>6} ({} rolled back)", counters.batches, counters.rollbacks);
    println!("   reload requests   {:>6}", sched.reloads());
    println!("   IMEM misses       {:>6}", counters.misses);
    println!("   IMEM block reads  {:>6}", imem.block_reads);
    println!(
        "   DMEM reads/writes {:>6} / {} ({} tag-only)",
        dmem.block_reads, dmem.block_writes, dmem.maps
    );
    println!();

    if lock.lock_count() != 0 || lock.is_suspended() {
        let state = lock.snapshot();
        bail!(
            "DMA lock unbalanced after run: {} locks, {} suspensions",
            state.lock_count,
            state.suspend_count
        );
    }

    println!(
        "{}",
        format!(
            "✓ Simulation completed in {:.2}s",
            start.elapsed().as_secs_f64()
        )
        .green()
        .bold()
    );
    println!();
    Ok(())
}
