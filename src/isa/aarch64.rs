//! AArch64 instruction encoding.
//!
//! This module provides functions for encoding AArch64 instructions
//! as machine code bytes, plus the branch encoders used when relocating
//! call sites.

use super::codebuf::CodeBuffer;

/// NOP
pub const NOP: u32 = 0xD503201F;
/// RET X30
pub const RET: u32 = 0xD65F03C0;

const B_OPCODE: u32 = 0x14000000;
const BL_OPCODE: u32 = 0x94000000;

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0, X1 = 1, X2 = 2, X3 = 3,
    X4 = 4, X5 = 5, X6 = 6, X7 = 7,
    X8 = 8, X9 = 9, X10 = 10, X11 = 11,
    X12 = 12, X13 = 13, X14 = 14, X15 = 15,
    X16 = 16, X17 = 17,
    Fp = 29,  // Frame pointer
    Lr = 30,  // Link register
    Sp = 31,  // Stack pointer / Zero register (XZR in some contexts)
}

impl Reg {
    /// Alias for SP when used as zero register
    pub const ZR: Reg = Reg::Sp;

    pub fn code(self) -> u32 {
        self as u32
    }

    /// The n-th argument register.
    pub fn arg(n: u8) -> Reg {
        match n {
            0 => Reg::X0,
            1 => Reg::X1,
            2 => Reg::X2,
            3 => Reg::X3,
            4 => Reg::X4,
            5 => Reg::X5,
            6 => Reg::X6,
            _ => Reg::X7,
        }
    }
}

/// SIMD/FP register number (v0..v31).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VReg(pub u8);

impl VReg {
    pub const V0: VReg = VReg(0);
    pub const V1: VReg = VReg(1);

    fn code(self) -> u32 {
        (self.0 & 0x1F) as u32
    }
}

/// Operand width of an integer instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W,
    X,
}

impl Width {
    fn sf(self) -> u32 {
        match self {
            Width::W => 0,
            Width::X => 1 << 31,
        }
    }
}

/// Precision of a floating-point instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpSize {
    S,
    D,
}

impl FpSize {
    fn ty(self) -> u32 {
        match self {
            FpSize::S => 0,
            FpSize::D => 1 << 22,
        }
    }
}

/// Encode a B (or BL when `link`) with a byte displacement from the instruction.
pub fn encode_branch(link: bool, disp: i64) -> Option<u32> {
    if disp % 4 != 0 {
        return None;
    }
    let words = disp / 4;
    if !(-(1 << 25)..(1 << 25)).contains(&words) {
        return None;
    }
    let opcode = if link { BL_OPCODE } else { B_OPCODE };
    Some(opcode | ((words as u32) & 0x03FFFFFF))
}

/// Decode a B/BL into (is_link, byte displacement).
pub fn decode_branch(inst: u32) -> Option<(bool, i64)> {
    let link = match inst & 0xFC000000 {
        B_OPCODE => false,
        BL_OPCODE => true,
        _ => return None,
    };
    // sign-extend imm26
    let imm = ((inst & 0x03FFFFFF) << 6) as i32 >> 6;
    Some((link, imm as i64 * 4))
}

/// AArch64 assembler.
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Current position in the buffer, in bytes.
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    fn dp3(&mut self, base: u32, w: Width, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(base | w.sf() | (rm.code() << 16) | (rn.code() << 5) | rd.code());
    }

    // ==================== Data Processing ====================

    /// ADD Rd, Rn, Rm
    pub fn add(&mut self, w: Width, rd: Reg, rn: Reg, rm: Reg) {
        // s000 1011 000m mmmm 0000 00nn nnnd dddd
        self.dp3(0x0B000000, w, rd, rn, rm);
    }

    /// ADD Rd, Rn, #imm12 (Rn = 31 is SP)
    pub fn add_imm(&mut self, w: Width, rd: Reg, rn: Reg, imm12: u16) {
        // s001 0001 00ii iiii iiii iinn nnnd dddd
        let inst = 0x11000000
            | w.sf()
            | (((imm12 as u32) & 0xFFF) << 10)
            | (rn.code() << 5)
            | rd.code();
        self.emit_raw(inst);
    }

    /// SUB Rd, Rn, Rm
    pub fn sub(&mut self, w: Width, rd: Reg, rn: Reg, rm: Reg) {
        // s100 1011 000m mmmm 0000 00nn nnnd dddd
        self.dp3(0x4B000000, w, rd, rn, rm);
    }

    /// NEG Rd, Rm (SUB Rd, ZR, Rm)
    pub fn neg(&mut self, w: Width, rd: Reg, rm: Reg) {
        self.sub(w, rd, Reg::ZR, rm);
    }

    /// MUL Rd, Rn, Rm
    pub fn mul(&mut self, w: Width, rd: Reg, rn: Reg, rm: Reg) {
        // MADD Rd, Rn, Rm, ZR
        // s001 1011 000m mmmm 0111 11nn nnnd dddd
        self.dp3(0x1B007C00, w, rd, rn, rm);
    }

    /// AND Rd, Rn, Rm
    pub fn and(&mut self, w: Width, rd: Reg, rn: Reg, rm: Reg) {
        self.dp3(0x0A000000, w, rd, rn, rm);
    }

    /// ORR Rd, Rn, Rm
    pub fn orr(&mut self, w: Width, rd: Reg, rn: Reg, rm: Reg) {
        self.dp3(0x2A000000, w, rd, rn, rm);
    }

    /// EOR Rd, Rn, Rm (XOR)
    pub fn eor(&mut self, w: Width, rd: Reg, rn: Reg, rm: Reg) {
        self.dp3(0x4A000000, w, rd, rn, rm);
    }

    /// LSLV Rd, Rn, Rm (shift count taken modulo the width)
    pub fn lslv(&mut self, w: Width, rd: Reg, rn: Reg, rm: Reg) {
        // s001 1010 110m mmmm 0010 00nn nnnd dddd
        self.dp3(0x1AC02000, w, rd, rn, rm);
    }

    /// LSRV Rd, Rn, Rm
    pub fn lsrv(&mut self, w: Width, rd: Reg, rn: Reg, rm: Reg) {
        self.dp3(0x1AC02400, w, rd, rn, rm);
    }

    /// ASRV Rd, Rn, Rm
    pub fn asrv(&mut self, w: Width, rd: Reg, rn: Reg, rm: Reg) {
        self.dp3(0x1AC02800, w, rd, rn, rm);
    }

    /// MOV Rd, Rm (register to register; MOV Wd, Wm clears the upper half)
    pub fn mov(&mut self, w: Width, rd: Reg, rm: Reg) {
        // ORR Rd, ZR, Rm
        self.orr(w, rd, Reg::ZR, rm);
    }

    /// MOVZ Xd, #imm16, LSL #(16 * hw)
    pub fn movz(&mut self, rd: Reg, imm16: u16, hw: u8) {
        // 1101 0010 1hhi iiii iiii iiii iiid dddd
        let inst = 0xD2800000
            | (((hw & 3) as u32) << 21)
            | ((imm16 as u32) << 5)
            | rd.code();
        self.emit_raw(inst);
    }

    /// MOVK Xd, #imm16, LSL #(16 * hw)
    pub fn movk(&mut self, rd: Reg, imm16: u16, hw: u8) {
        // 1111 0010 1hhi iiii iiii iiii iiid dddd
        let inst = 0xF2800000
            | (((hw & 3) as u32) << 21)
            | ((imm16 as u32) << 5)
            | rd.code();
        self.emit_raw(inst);
    }

    /// Materialize a 64-bit constant with MOVZ + MOVK.
    pub fn mov_u64(&mut self, rd: Reg, value: u64) {
        self.movz(rd, value as u16, 0);
        for hw in 1..4u8 {
            let chunk = (value >> (16 * hw as u32)) as u16;
            if chunk != 0 {
                self.movk(rd, chunk, hw);
            }
        }
    }

    // ==================== Extension ====================

    /// SXTW Xd, Wn
    pub fn sxtw(&mut self, rd: Reg, rn: Reg) {
        // SBFM Xd, Xn, #0, #31
        self.emit_raw(0x93407C00 | (rn.code() << 5) | rd.code());
    }

    /// SXTB Wd, Wn
    pub fn sxtb(&mut self, rd: Reg, rn: Reg) {
        // SBFM Wd, Wn, #0, #7
        self.emit_raw(0x13001C00 | (rn.code() << 5) | rd.code());
    }

    /// SXTH Wd, Wn
    pub fn sxth(&mut self, rd: Reg, rn: Reg) {
        // SBFM Wd, Wn, #0, #15
        self.emit_raw(0x13003C00 | (rn.code() << 5) | rd.code());
    }

    /// UXTH Wd, Wn
    pub fn uxth(&mut self, rd: Reg, rn: Reg) {
        // UBFM Wd, Wn, #0, #15
        self.emit_raw(0x53003C00 | (rn.code() << 5) | rd.code());
    }

    // ==================== Floating point ====================

    fn fp3(&mut self, base: u32, size: FpSize, vd: VReg, vn: VReg, vm: VReg) {
        self.emit_raw(base | size.ty() | (vm.code() << 16) | (vn.code() << 5) | vd.code());
    }

    /// FADD Vd, Vn, Vm
    pub fn fadd(&mut self, size: FpSize, vd: VReg, vn: VReg, vm: VReg) {
        // 0001 1110 0t1m mmmm 0010 10nn nnnd dddd
        self.fp3(0x1E202800, size, vd, vn, vm);
    }

    /// FSUB Vd, Vn, Vm
    pub fn fsub(&mut self, size: FpSize, vd: VReg, vn: VReg, vm: VReg) {
        self.fp3(0x1E203800, size, vd, vn, vm);
    }

    /// FMUL Vd, Vn, Vm
    pub fn fmul(&mut self, size: FpSize, vd: VReg, vn: VReg, vm: VReg) {
        self.fp3(0x1E200800, size, vd, vn, vm);
    }

    /// FDIV Vd, Vn, Vm
    pub fn fdiv(&mut self, size: FpSize, vd: VReg, vn: VReg, vm: VReg) {
        self.fp3(0x1E201800, size, vd, vn, vm);
    }

    /// FNEG Vd, Vn
    pub fn fneg(&mut self, size: FpSize, vd: VReg, vn: VReg) {
        self.emit_raw(0x1E214000 | size.ty() | (vn.code() << 5) | vd.code());
    }

    /// FCVTZS Rd, Vn (round toward zero, saturating, NaN to 0)
    pub fn fcvtzs(&mut self, w: Width, size: FpSize, rd: Reg, vn: VReg) {
        self.emit_raw(0x1E380000 | w.sf() | size.ty() | (vn.code() << 5) | rd.code());
    }

    /// SCVTF Vd, Rn
    pub fn scvtf(&mut self, size: FpSize, w: Width, vd: VReg, rn: Reg) {
        self.emit_raw(0x1E220000 | w.sf() | size.ty() | (rn.code() << 5) | vd.code());
    }

    /// FCVT between precisions; `to` is the destination size.
    pub fn fcvt(&mut self, to: FpSize, vd: VReg, vn: VReg) {
        let inst = match to {
            // FCVT Dd, Sn
            FpSize::D => 0x1E22C000,
            // FCVT Sd, Dn
            FpSize::S => 0x1E624000,
        };
        self.emit_raw(inst | (vn.code() << 5) | vd.code());
    }

    // ==================== Loads and Stores ====================

    /// LDR Xt, [Xn, #imm12] (load 64-bit, unsigned offset)
    pub fn ldr(&mut self, rt: Reg, rn: Reg, imm12: u16) {
        // 1111 1001 01ii iiii iiii iinn nnnt tttt
        // imm12 is scaled by 8 (bytes)
        let scaled = (imm12 / 8) as u32;
        let inst = 0xF9400000 | ((scaled & 0xFFF) << 10) | (rn.code() << 5) | rt.code();
        self.emit_raw(inst);
    }

    /// STR Xt, [Xn, #imm12] (store 64-bit, unsigned offset)
    pub fn str(&mut self, rt: Reg, rn: Reg, imm12: u16) {
        // 1111 1001 00ii iiii iiii iinn nnnt tttt
        let scaled = (imm12 / 8) as u32;
        let inst = 0xF9000000 | ((scaled & 0xFFF) << 10) | (rn.code() << 5) | rt.code();
        self.emit_raw(inst);
    }

    /// LDR St/Dt, [Xn, #imm12]
    pub fn ldr_fp(&mut self, size: FpSize, vt: VReg, rn: Reg, imm12: u16) {
        let (base, scale) = match size {
            FpSize::S => (0xBD400000, 4),
            FpSize::D => (0xFD400000, 8),
        };
        let scaled = (imm12 / scale) as u32;
        self.emit_raw(base | ((scaled & 0xFFF) << 10) | (rn.code() << 5) | vt.code());
    }

    /// STR St/Dt, [Xn, #imm12]
    pub fn str_fp(&mut self, size: FpSize, vt: VReg, rn: Reg, imm12: u16) {
        let (base, scale) = match size {
            FpSize::S => (0xBD000000, 4),
            FpSize::D => (0xFD000000, 8),
        };
        let scaled = (imm12 / scale) as u32;
        self.emit_raw(base | ((scaled & 0xFFF) << 10) | (rn.code() << 5) | vt.code());
    }

    // ==================== Branches ====================

    /// B to a byte offset from this instruction
    pub fn b(&mut self, offset: i32) {
        // 0001 01ii iiii iiii iiii iiii iiii iiii
        self.emit_raw(B_OPCODE | ((offset / 4) as u32 & 0x03FFFFFF));
    }

    /// BL to a byte offset from this instruction
    pub fn bl(&mut self, offset: i32) {
        // 1001 01ii iiii iiii iiii iiii iiii iiii
        self.emit_raw(BL_OPCODE | ((offset / 4) as u32 & 0x03FFFFFF));
    }

    /// BL to a label in the same buffer
    pub fn bl_label(&mut self, label: &str) {
        self.buf.emit_branch_ref(BL_OPCODE, label);
    }

    /// RET (return to link register)
    pub fn ret(&mut self) {
        self.emit_raw(RET);
    }

    /// BR Xn (branch to register)
    pub fn br(&mut self, rn: Reg) {
        // 1101 0110 0001 1111 0000 00nn nnn0 0000
        self.emit_raw(0xD61F0000 | (rn.code() << 5));
    }

    // ==================== Stack operations ====================

    /// STP X1, X2, [SP, #imm]! (store pair with pre-index)
    pub fn stp_pre(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA9800000
            | (scaled << 15)
            | (rt2.code() << 10)
            | (Reg::Sp.code() << 5)
            | rt1.code();
        self.emit_raw(inst);
    }

    /// LDP X1, X2, [SP], #imm (load pair with post-index)
    pub fn ldp_post(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA8C00000
            | (scaled << 15)
            | (rt2.code() << 10)
            | (Reg::Sp.code() << 5)
            | rt1.code();
        self.emit_raw(inst);
    }

    /// NOP (no operation)
    pub fn nop(&mut self) {
        self.emit_raw(NOP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(f: impl FnOnce(&mut AArch64Assembler)) -> Vec<u32> {
        let mut buf = CodeBuffer::new();
        f(&mut AArch64Assembler::new(&mut buf));
        buf.code()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_add() {
        // ADD X0, X1, X2 = 0x8B020020, ADD W0, W0, W1 = 0x0B010000
        let code = assemble(|asm| {
            asm.add(Width::X, Reg::X0, Reg::X1, Reg::X2);
            asm.add(Width::W, Reg::X0, Reg::X0, Reg::X1);
        });
        assert_eq!(code, vec![0x8B020020, 0x0B010000]);
    }

    #[test]
    fn test_shifts_and_extends() {
        let code = assemble(|asm| {
            asm.lslv(Width::X, Reg::X0, Reg::X0, Reg::X1);
            asm.asrv(Width::W, Reg::X0, Reg::X0, Reg::X1);
            asm.sxtw(Reg::X0, Reg::X0);
            asm.sxtb(Reg::X0, Reg::X0);
        });
        // LSL X0, X0, X1; ASR W0, W0, W1; SXTW X0, W0; SXTB W0, W0
        assert_eq!(code, vec![0x9AC12000, 0x1AC12800, 0x93407C00, 0x13001C00]);
    }

    #[test]
    fn test_fp() {
        let code = assemble(|asm| {
            asm.fadd(FpSize::D, VReg::V0, VReg::V0, VReg::V1);
            asm.fdiv(FpSize::S, VReg::V0, VReg::V0, VReg::V1);
            asm.fcvtzs(Width::W, FpSize::D, Reg::X0, VReg::V0);
        });
        // FADD D0, D0, D1; FDIV S0, S0, S1; FCVTZS W0, D0
        assert_eq!(code, vec![0x1E612800, 0x1E211800, 0x1E780000]);
    }

    #[test]
    fn test_mov_u64() {
        let code = assemble(|asm| asm.mov_u64(Reg::X16, 0x1000_0040));
        // MOVZ X16, #0x40; MOVK X16, #0x1000, LSL #16
        assert_eq!(code, vec![0xD2800810, 0xF2A20010]);
    }

    #[test]
    fn test_ret() {
        assert_eq!(assemble(|asm| asm.ret()), vec![0xD65F03C0]);
    }

    #[test]
    fn test_branch_encoding() {
        assert_eq!(encode_branch(true, 8), Some(0x94000002));
        assert_eq!(encode_branch(false, -4), Some(0x17FFFFFF));
        assert_eq!(decode_branch(0x17FFFFFF), Some((false, -4)));
        assert_eq!(decode_branch(0x94000002), Some((true, 8)));
        assert_eq!(encode_branch(true, 6), None);
        assert_eq!(encode_branch(true, 1 << 28), None);
        assert_eq!(decode_branch(NOP), None);
    }
}
