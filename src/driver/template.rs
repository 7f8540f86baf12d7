//! In-process AArch64 template compiler.
//!
//! Produces real machine code for the catalogue operations so the harness
//! can run end to end without an external compiler. Routines are placed in a
//! bump-allocated boot code region that only `reset_boot_region` clears.
//!
//! `baseline` code builds a frame, spills and reloads its arguments around
//! every operation and routes static calls through the trampoline.
//! `optimizing` code works on the argument registers directly and calls
//! static targets with a direct `bl`.

use super::{BackendError, BackendId, BootRegion, CompilerBackend};
use crate::isa::aarch64::{AArch64Assembler, FpSize, Reg, VReg, Width};
use crate::isa::codebuf::CodeBuffer;
use crate::isa::Isa;
use crate::kind::Kind;
use crate::oracle;
use crate::routine::{CallSite, CompiledRoutine, SelfPatch};
use tracing::debug;

/// First address of the boot code region.
pub const BOOT_REGION_START: u64 = 0x1000_0000;
/// The static trampoline lives outside the boot region.
pub const TRAMPOLINE_ADDRESS: u64 = 0x0FFF_F000;
pub const TRAMPOLINE_NAME: &str = "static_trampoline";
/// Callee of the `invokestatic` operation.
pub const HELPER_NAME: &str = "invokestatic_helper";

const ROUTINE_ALIGNMENT: u64 = 16;
/// Frame record plus two argument spill slots
const FRAME_SIZE: i16 = 32;

pub struct TemplateBackend {
    next: u64,
}

impl Default for TemplateBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateBackend {
    pub fn new() -> Self {
        Self {
            next: BOOT_REGION_START,
        }
    }

    /// The template compiler only emits AArch64 code.
    pub fn for_target(isa: Isa) -> Result<Self, BackendError> {
        match isa {
            Isa::Aarch64 => Ok(Self::new()),
            other => Err(BackendError::Unsupported(format!(
                "the template backend cannot generate {} code",
                other
            ))),
        }
    }

    /// Bytes allocated in the boot region since the last reset.
    pub fn used(&self) -> u64 {
        self.next - BOOT_REGION_START
    }

    fn allocate(&mut self, len: usize) -> u64 {
        let address = self.next;
        self.next += (len as u64).next_multiple_of(ROUTINE_ALIGNMENT);
        address
    }

    fn method(
        &mut self,
        name: &str,
        code: Vec<u8>,
        calls: Vec<CallSite>,
    ) -> Result<CompiledRoutine, BackendError> {
        let address = self.allocate(code.len());
        Ok(CompiledRoutine::method(name, address, code, calls)?)
    }

    fn compile_invokestatic(
        &mut self,
        backend: BackendId,
    ) -> Result<Vec<CompiledRoutine>, BackendError> {
        let mut buf = CodeBuffer::new();
        let mut asm = AArch64Assembler::new(&mut buf);
        asm.mul(Width::W, Reg::X0, Reg::X0, Reg::X1);
        asm.ret();
        let helper = self.method(HELPER_NAME, buf.finish()?, Vec::new())?;
        let helper_address = helper.original_address();

        let mut buf = CodeBuffer::new();
        let mut asm = AArch64Assembler::new(&mut buf);
        let site = match backend {
            BackendId::Baseline => {
                prologue(&mut asm);
                spill_reload(&mut asm, &[Kind::Int, Kind::Int]);
                let site = asm.offset();
                asm.bl(0);
                asm.add_imm(Width::W, Reg::X0, Reg::X0, 1);
                epilogue(&mut asm);
                site
            }
            BackendId::Optimizing => {
                asm.stp_pre(Reg::Fp, Reg::Lr, -16);
                asm.add_imm(Width::X, Reg::Fp, Reg::Sp, 0);
                let site = asm.offset();
                asm.bl(0);
                asm.add_imm(Width::W, Reg::X0, Reg::X0, 1);
                asm.ldp_post(Reg::Fp, Reg::Lr, 16);
                asm.ret();
                site
            }
        };
        let code = buf.finish()?;

        let routines = match backend {
            BackendId::Baseline => {
                let call = CallSite {
                    via_trampoline: true,
                    ..CallSite::call(site, TRAMPOLINE_ADDRESS)
                };
                let caller = self.method("invokestatic", code, vec![call])?;
                // the trampoline would bind this call to the helper
                let trampoline = build_trampoline(Some(helper_address))?;
                vec![helper, caller, trampoline]
            }
            BackendId::Optimizing => {
                let call = CallSite::call(site, helper_address);
                let caller = self.method("invokestatic", code, vec![call])?;
                vec![helper, caller]
            }
        };
        Ok(routines)
    }
}

/// `stp x29, x30, [sp, #-32]!; mov x29, sp`
fn prologue(asm: &mut AArch64Assembler) {
    asm.stp_pre(Reg::Fp, Reg::Lr, -FRAME_SIZE);
    asm.add_imm(Width::X, Reg::Fp, Reg::Sp, 0);
}

fn epilogue(asm: &mut AArch64Assembler) {
    asm.ldp_post(Reg::Fp, Reg::Lr, FRAME_SIZE);
    asm.ret();
}

/// Store every argument to its frame slot and load it back.
fn spill_reload(asm: &mut AArch64Assembler, params: &[Kind]) {
    let mut ints = 0u8;
    let mut floats = 0u8;
    let slots: Vec<(Kind, u8, u16)> = params
        .iter()
        .enumerate()
        .map(|(i, kind)| {
            let offset = 16 + 8 * i as u16;
            let reg = match kind {
                Kind::Float | Kind::Double => {
                    floats += 1;
                    floats - 1
                }
                _ => {
                    ints += 1;
                    ints - 1
                }
            };
            (*kind, reg, offset)
        })
        .collect();

    for &(kind, reg, offset) in &slots {
        match kind {
            Kind::Float => asm.str_fp(FpSize::S, VReg(reg), Reg::Sp, offset),
            Kind::Double => asm.str_fp(FpSize::D, VReg(reg), Reg::Sp, offset),
            _ => asm.str(Reg::arg(reg), Reg::Sp, offset),
        }
    }
    for &(kind, reg, offset) in &slots {
        match kind {
            Kind::Float => asm.ldr_fp(FpSize::S, VReg(reg), Reg::Sp, offset),
            Kind::Double => asm.ldr_fp(FpSize::D, VReg(reg), Reg::Sp, offset),
            _ => asm.ldr(Reg::arg(reg), Reg::Sp, offset),
        }
    }
}

/// Emit the operation on x0/x1 (or v0/v1), leaving the result in x0 (or v0).
fn emit_operation(asm: &mut AArch64Assembler, name: &str) -> Result<(), BackendError> {
    use Reg::{X0, X1};
    let (v0, v1) = (VReg::V0, VReg::V1);
    match name {
        "iadd" => asm.add(Width::W, X0, X0, X1),
        "isub" => asm.sub(Width::W, X0, X0, X1),
        "imul" => asm.mul(Width::W, X0, X0, X1),
        "iand" => asm.and(Width::W, X0, X0, X1),
        "ior" => asm.orr(Width::W, X0, X0, X1),
        "ixor" => asm.eor(Width::W, X0, X0, X1),
        "ishl" => asm.lslv(Width::W, X0, X0, X1),
        "ishr" => asm.asrv(Width::W, X0, X0, X1),
        "iushr" => asm.lsrv(Width::W, X0, X0, X1),
        "ineg" => asm.neg(Width::W, X0, X0),
        "ladd" => asm.add(Width::X, X0, X0, X1),
        "lsub" => asm.sub(Width::X, X0, X0, X1),
        "lmul" => asm.mul(Width::X, X0, X0, X1),
        "land" => asm.and(Width::X, X0, X0, X1),
        "lor" => asm.orr(Width::X, X0, X0, X1),
        "lxor" => asm.eor(Width::X, X0, X0, X1),
        "lshl" => asm.lslv(Width::X, X0, X0, X1),
        "lshr" => asm.asrv(Width::X, X0, X0, X1),
        "lushr" => asm.lsrv(Width::X, X0, X0, X1),
        "lneg" => asm.neg(Width::X, X0, X0),
        "i2l" => asm.sxtw(X0, X0),
        "l2i" => asm.mov(Width::W, X0, X0),
        "i2b" => asm.sxtb(X0, X0),
        "i2s" => asm.sxth(X0, X0),
        "i2c" => asm.uxth(X0, X0),
        "i2f" => asm.scvtf(FpSize::S, Width::W, v0, X0),
        "i2d" => asm.scvtf(FpSize::D, Width::W, v0, X0),
        "l2f" => asm.scvtf(FpSize::S, Width::X, v0, X0),
        "l2d" => asm.scvtf(FpSize::D, Width::X, v0, X0),
        "f2i" => asm.fcvtzs(Width::W, FpSize::S, X0, v0),
        "f2l" => asm.fcvtzs(Width::X, FpSize::S, X0, v0),
        "d2i" => asm.fcvtzs(Width::W, FpSize::D, X0, v0),
        "d2l" => asm.fcvtzs(Width::X, FpSize::D, X0, v0),
        "f2d" => asm.fcvt(FpSize::D, v0, v0),
        "d2f" => asm.fcvt(FpSize::S, v0, v0),
        "fadd" => asm.fadd(FpSize::S, v0, v0, v1),
        "fsub" => asm.fsub(FpSize::S, v0, v0, v1),
        "fmul" => asm.fmul(FpSize::S, v0, v0, v1),
        "fdiv" => asm.fdiv(FpSize::S, v0, v0, v1),
        "fneg" => asm.fneg(FpSize::S, v0, v0),
        "dadd" => asm.fadd(FpSize::D, v0, v0, v1),
        "dsub" => asm.fsub(FpSize::D, v0, v0, v1),
        "dmul" => asm.fmul(FpSize::D, v0, v0, v1),
        "ddiv" => asm.fdiv(FpSize::D, v0, v0, v1),
        "dneg" => asm.fneg(FpSize::D, v0, v0),
        other => return Err(BackendError::UnknownMethod(other.to_string())),
    }
    Ok(())
}

/// The lazy-binding stub. In the VM the first 16 bytes are rewritten once the
/// callee is resolved; the resolver leaves the target in x16.
fn build_trampoline(resolves_to: Option<u64>) -> Result<CompiledRoutine, BackendError> {
    let mut buf = CodeBuffer::new();
    let mut asm = AArch64Assembler::new(&mut buf);
    asm.stp_pre(Reg::Fp, Reg::Lr, -16);
    asm.bl_label("resolve");
    asm.ldp_post(Reg::Fp, Reg::Lr, 16);
    asm.br(Reg::X16);
    buf.define_label("resolve");
    let mut asm = AArch64Assembler::new(&mut buf);
    asm.movz(Reg::X16, 0, 0);
    asm.ret();

    Ok(CompiledRoutine::trampoline(
        TRAMPOLINE_NAME,
        TRAMPOLINE_ADDRESS,
        buf.finish()?,
        Vec::new(),
        Some(SelfPatch {
            offset: 0,
            length: 16,
            resolves_to,
        }),
    )?)
}

impl CompilerBackend for TemplateBackend {
    fn isa(&self) -> Isa {
        Isa::Aarch64
    }

    fn reset_boot_region(&mut self) -> Result<BootRegion, BackendError> {
        debug!(released = self.used(), "reset boot region");
        self.next = BOOT_REGION_START;
        Ok(BootRegion {
            start: BOOT_REGION_START,
            used: self.used(),
        })
    }

    fn compile_method(
        &mut self,
        method: &str,
        backend: BackendId,
    ) -> Result<Vec<CompiledRoutine>, BackendError> {
        let op = oracle::lookup(method)
            .ok_or_else(|| BackendError::UnknownMethod(method.to_string()))?;
        if method == "invokestatic" {
            return self.compile_invokestatic(backend);
        }

        let mut buf = CodeBuffer::new();
        let mut asm = AArch64Assembler::new(&mut buf);
        match backend {
            BackendId::Baseline => {
                prologue(&mut asm);
                spill_reload(&mut asm, op.params);
                emit_operation(&mut asm, method)?;
                epilogue(&mut asm);
            }
            BackendId::Optimizing => {
                emit_operation(&mut asm, method)?;
                asm.ret();
            }
        }
        let routine = self.method(method, buf.finish()?, Vec::new())?;
        Ok(vec![routine])
    }

    fn static_trampoline(&mut self) -> Result<CompiledRoutine, BackendError> {
        build_trampoline(None)
    }
}
