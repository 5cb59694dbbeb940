// Criterion benchmarks for dispatch-engine throughput.
//
// These benches use the identity-mapped `FlatTestBus` and a constant decoder
// so results reflect boundary-scan/dispatch/retire overhead rather than
// decode or memory-model costs.

#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use quartz_cpu_core::exec::{self, InsnDecoder, RunExit, StaticVector};
#[cfg(not(target_arch = "wasm32"))]
use quartz_cpu_core::mem::FlatTestBus;
#[cfg(not(target_arch = "wasm32"))]
use quartz_cpu_core::state::{CpuFeatures, CpuState};
#[cfg(not(target_arch = "wasm32"))]
use quartz_x86::{
    AluOp, DecodeError, DecodedInsn, FetchMask, Gpr, InsnKind, Operand, Reg, Seg, Width,
};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    // Default to a CI-friendly profile; opt into longer runs explicitly with
    // `QUARTZ_BENCH_PROFILE=full`.
    match std::env::var("QUARTZ_BENCH_PROFILE").as_deref() {
        Ok("full") => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
        _ => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
    }
}

/// Decoder that resolves every address to the same instruction. The stream
/// never ends; real-mode IP wraps at 64 KiB and keeps going.
#[cfg(not(target_arch = "wasm32"))]
struct ConstDecoder(DecodedInsn);

#[cfg(not(target_arch = "wasm32"))]
impl InsnDecoder for ConstDecoder {
    fn decode(
        &self,
        _window: &[u8],
        _ip: u64,
        _fetch_mask: FetchMask,
    ) -> Result<DecodedInsn, DecodeError> {
        Ok(self.0)
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_state() -> CpuState {
    let mut state = CpuState::new(CpuFeatures::all_features());
    for seg in [Seg::Cs, Seg::Ss, Seg::Ds] {
        state.load_segment_real(seg, 0);
    }
    state.set_rip(0);
    state.commit_rip();
    state.write64(Gpr::Rsp.index(), 0x8000);
    state
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_step_throughput(c: &mut Criterion) {
    const INSTS_PER_ITER: u64 = 20_000;

    // 64 KiB of code-segment reach plus fetch-window slack.
    let mut bus = FlatTestBus::new(0x1_1000);
    let mut pic = StaticVector(0x20);

    let nop = ConstDecoder(DecodedInsn::new(InsnKind::Nop, 1));
    let mut nop_state = bench_state();

    // ADD AL, 1 keeps the lazy-flag shadow hot on every retirement.
    let add = ConstDecoder(DecodedInsn::new(
        InsnKind::Alu {
            op: AluOp::Add,
            dst: Operand::Reg(Reg::new(Gpr::Rax, Width::W8)),
            src: Operand::Imm(1),
            width: Width::W8,
        },
        1,
    ));
    let mut add_state = bench_state();

    let mut group = c.benchmark_group("step_throughput");
    group.throughput(Throughput::Elements(INSTS_PER_ITER));

    group.bench_function("nop_stream", |b| {
        b.iter(|| {
            nop_state.set_rip(0);
            nop_state.commit_rip();
            let res = exec::run(
                black_box(&mut nop_state),
                black_box(&mut bus),
                &nop,
                &mut pic,
                INSTS_PER_ITER,
            );
            debug_assert!(matches!(res.exit, RunExit::Completed));
            black_box(res.retired);
        })
    });

    group.bench_function("add_imm_stream", |b| {
        b.iter(|| {
            add_state.set_rip(0);
            add_state.commit_rip();
            let res = exec::run(
                black_box(&mut add_state),
                black_box(&mut bus),
                &add,
                &mut pic,
                INSTS_PER_ITER,
            );
            debug_assert!(matches!(res.exit, RunExit::Completed));
            black_box(res.retired);
        })
    });

    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_step_throughput
}

#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
