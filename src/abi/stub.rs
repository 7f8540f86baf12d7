//! Invocation stub generation.
//!
//! The stub is a tiny bare-metal program: it sets up a stack, enables the
//! FPU, loads every literal argument where the calling convention wants it,
//! branches with link into the relocated code and then parks at
//! `crossjit_stop`, where the register file is captured.
//!
//! Every literal is written as a hexadecimal bit pattern loaded from the
//! literal pool, so values such as NaN, infinities or `-0.0` never need a
//! numeric spelling the assembler might reject or round.

use super::{ArgLocation, FloatReg, assign};
use crate::error::VectorError;
use crate::isa::Isa;
use crate::kind::{RegisterClass, Signature, TestVector, Value};
use crate::link::EntryPoint;
use serde::{Deserialize, Serialize};

/// Symbol at the start of the relocated code.
pub const CODE_SYMBOL: &str = "crossjit_code";
/// Symbol the stub parks at after the call returns.
pub const STOP_SYMBOL: &str = "crossjit_stop";
/// File the relocated code is included from.
pub const CODE_FILE: &str = "code.bin";

const PAGE_SIZE: u64 = 0x1000;

/// Where the stub and its stack live in simulated memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StubLayout {
    /// Load address of the stub's text section
    pub load_address: u64,
    /// Initial stack pointer
    pub stack_top: u64,
}

impl StubLayout {
    pub fn for_target(isa: Isa) -> Self {
        match isa {
            // versatilepb loads -kernel images at 0x10000, 128M of RAM
            Isa::Armv7 => Self {
                load_address: 0x0001_0000,
                stack_top: 0x07F0_0000,
            },
            // virt RAM starts at 1G
            Isa::Aarch64 => Self {
                load_address: 0x4008_0000,
                stack_top: 0x4800_0000,
            },
        }
    }
}

/// Generated assembler source and linker script for one test vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubSource {
    pub assembly: String,
    pub linker_script: String,
}

/// Assembly text with the target's comment syntax.
struct Asm {
    text: String,
    comment: &'static str,
}

impl Asm {
    fn new(isa: Isa) -> Self {
        let comment = match isa {
            Isa::Armv7 => "@",
            Isa::Aarch64 => "//",
        };
        Self {
            text: String::new(),
            comment,
        }
    }

    fn op(&mut self, inst: impl AsRef<str>) {
        self.text.push_str("    ");
        self.text.push_str(inst.as_ref());
        self.text.push('\n');
    }

    fn op_note(&mut self, inst: impl AsRef<str>, note: impl AsRef<str>) {
        let inst = inst.as_ref();
        self.text.push_str(&format!(
            "    {:<32}{} {}\n",
            inst,
            self.comment,
            note.as_ref()
        ));
    }

    fn note(&mut self, note: impl AsRef<str>) {
        self.text
            .push_str(&format!("    {} {}\n", self.comment, note.as_ref()));
    }

    fn label(&mut self, name: &str) {
        self.text.push_str(name);
        self.text.push_str(":\n");
    }

    fn blank(&mut self) {
        self.text.push('\n');
    }
}

fn describe(index: usize, value: &Value) -> String {
    format!("arg {}: {} {}", index, value.kind(), value)
}

/// Build the glue that calls `entry` with the literals in `vector`.
///
/// `code_base` is the original base address of the relocation buffer; the
/// code section keeps its offset within a page.
pub fn build_invocation_stub(
    isa: Isa,
    signature: &Signature,
    vector: &TestVector,
    entry: EntryPoint,
    code_base: u64,
    layout: &StubLayout,
) -> Result<StubSource, VectorError> {
    check_vector(isa, signature, vector)?;
    let args = assign(isa, &signature.params)
        .map_err(|e| VectorError::UnsupportedSignature(e.to_string()))?;

    let mut asm = Asm::new(isa);
    match isa {
        Isa::Armv7 => {
            asm.op(".syntax unified");
            asm.op(".arm");
        }
        Isa::Aarch64 => {}
    }
    asm.op(".section .text.crossjit_entry, \"ax\"");
    asm.op(".global _start");
    asm.label("_start");
    asm.note(format!("signature: {}", signature));

    match isa {
        Isa::Armv7 => emit_armv7(&mut asm, vector, &args.locations, args.stack_size, layout),
        Isa::Aarch64 => emit_aarch64(&mut asm, vector, &args.locations, args.stack_size, layout),
    }

    asm.op(format!("bl {}+0x{:x}", CODE_SYMBOL, entry.offset));
    asm.op(format!(".global {}", STOP_SYMBOL));
    asm.label(STOP_SYMBOL);
    asm.op(format!("b {}", STOP_SYMBOL));
    asm.op(".ltorg");
    asm.blank();
    asm.op(".section .crossjit_code, \"ax\"");
    asm.op(format!(".global {}", CODE_SYMBOL));
    asm.label(CODE_SYMBOL);
    asm.op(format!(".incbin \"{}\"", CODE_FILE));

    Ok(StubSource {
        assembly: asm.text,
        linker_script: linker_script(layout, code_base),
    })
}

fn check_vector(isa: Isa, signature: &Signature, vector: &TestVector) -> Result<(), VectorError> {
    if vector.args.len() != signature.params.len() {
        return Err(VectorError::UnsupportedSignature(format!(
            "`{}` takes {} arguments, vector has {}",
            signature,
            signature.params.len(),
            vector.args.len()
        )));
    }
    for (i, (value, kind)) in vector.args.iter().zip(&signature.params).enumerate() {
        if value.kind() != *kind {
            return Err(VectorError::UnsupportedSignature(format!(
                "argument {} is {}, `{}` expects {}",
                i,
                value.kind(),
                signature,
                kind
            )));
        }
        if let Value::Reference(address) = value {
            if isa.pointer_size() == 4 && *address > u32::MAX as u64 {
                return Err(VectorError::UnsupportedSignature(format!(
                    "reference 0x{:x} does not fit a 32-bit register",
                    address
                )));
            }
        }
    }
    Ok(())
}

fn emit_armv7(
    asm: &mut Asm,
    vector: &TestVector,
    locations: &[ArgLocation],
    stack_size: u64,
    layout: &StubLayout,
) {
    asm.op(format!("ldr sp, =0x{:08x}", layout.stack_top));
    asm.note("enable the VFP unit");
    asm.op("mrc p15, 0, r12, c1, c0, 2");
    asm.op("orr r12, r12, #0x00f00000");
    asm.op("mcr p15, 0, r12, c1, c0, 2");
    asm.op("isb");
    asm.op("mov r12, #0x40000000");
    asm.op("vmsr fpexc, r12");

    if stack_size > 0 {
        // one entry per outgoing word; None is padding
        let mut words: Vec<Option<(u32, String)>> = vec![None; (stack_size / 4) as usize];
        for (i, (value, location)) in vector.args.iter().zip(locations).enumerate() {
            if let ArgLocation::Stack { offset, size } = *location {
                let slot = (offset / 4) as usize;
                let bits = value.raw_bits();
                words[slot] = Some((bits as u32, describe(i, value)));
                if size == 8 {
                    words[slot + 1] = Some(((bits >> 32) as u32, format!("arg {}: high word", i)));
                }
            }
        }
        asm.note(format!("outgoing stack arguments ({} bytes)", stack_size));
        for word in words.iter().rev() {
            match word {
                Some((bits, note)) => asm.op_note(format!("ldr r12, =0x{:08x}", bits), note),
                None => asm.op_note("mov r12, #0", "padding"),
            }
            asm.op("push {r12}");
        }
    }

    for (i, (value, location)) in vector.args.iter().zip(locations).enumerate() {
        let bits = value.raw_bits();
        match *location {
            ArgLocation::Fpr(FloatReg::S(s)) => {
                asm.op_note(format!("ldr r12, =0x{:08x}", bits as u32), describe(i, value));
                asm.op(format!("vmov s{}, r12", s));
            }
            ArgLocation::Fpr(FloatReg::D(d)) => {
                asm.op_note(format!("ldr r12, =0x{:08x}", bits as u32), describe(i, value));
                asm.op(format!("ldr lr, =0x{:08x}", (bits >> 32) as u32));
                asm.op(format!("vmov d{}, r12, lr", d));
            }
            _ => {}
        }
    }

    for (i, (value, location)) in vector.args.iter().zip(locations).enumerate() {
        let bits = value.raw_bits();
        match *location {
            ArgLocation::Gpr(r) => {
                asm.op_note(format!("ldr r{}, =0x{:08x}", r, bits as u32), describe(i, value));
            }
            ArgLocation::GprPair { lo, hi } => {
                asm.op_note(format!("ldr r{}, =0x{:08x}", lo, bits as u32), describe(i, value));
                asm.op(format!("ldr r{}, =0x{:08x}", hi, (bits >> 32) as u32));
            }
            _ => {}
        }
    }
}

fn emit_aarch64(
    asm: &mut Asm,
    vector: &TestVector,
    locations: &[ArgLocation],
    stack_size: u64,
    layout: &StubLayout,
) {
    asm.op(format!("ldr x16, =0x{:x}", layout.stack_top));
    asm.op("mov sp, x16");
    asm.note("enable FP/SIMD at EL1");
    asm.op("mrs x16, cpacr_el1");
    asm.op("orr x16, x16, #0x300000");
    asm.op("msr cpacr_el1, x16");
    asm.op("isb");

    if stack_size > 0 {
        asm.note(format!("outgoing stack arguments ({} bytes)", stack_size));
        asm.op(format!("ldr x16, =0x{:x}", stack_size));
        asm.op("sub sp, sp, x16");
        for (i, (value, location)) in vector.args.iter().zip(locations).enumerate() {
            if let ArgLocation::Stack { offset, .. } = *location {
                asm.op_note(
                    format!("ldr x16, =0x{:016x}", value.extended_bits()),
                    describe(i, value),
                );
                asm.op(format!("str x16, [sp, #0x{:x}]", offset));
            }
        }
    }

    for (i, (value, location)) in vector.args.iter().zip(locations).enumerate() {
        let bits = value.raw_bits();
        match *location {
            ArgLocation::Fpr(FloatReg::S(s)) => {
                asm.op_note(format!("ldr w16, =0x{:08x}", bits as u32), describe(i, value));
                asm.op(format!("fmov s{}, w16", s));
            }
            ArgLocation::Fpr(FloatReg::D(d)) => {
                asm.op_note(format!("ldr x16, =0x{:016x}", bits), describe(i, value));
                asm.op(format!("fmov d{}, x16", d));
            }
            _ => {}
        }
    }

    for (i, (value, location)) in vector.args.iter().zip(locations).enumerate() {
        if let ArgLocation::Gpr(r) = *location {
            let inst = match value.kind().register_class() {
                RegisterClass::Word => format!("ldr w{}, =0x{:08x}", r, value.raw_bits() as u32),
                _ => format!("ldr x{}, =0x{:016x}", r, value.raw_bits()),
            };
            asm.op_note(inst, describe(i, value));
        }
    }
}

fn linker_script(layout: &StubLayout, code_base: u64) -> String {
    format!(
        "/* code buffer base 0x{base:x} */
ENTRY(_start)
SECTIONS
{{
    . = 0x{load:x};
    .text : {{ *(.text.crossjit_entry) *(.text .text.*) }}
    .rodata : {{ *(.rodata .rodata.*) }}
    . = ALIGN(0x{page:x}) + 0x{offset:x};
    .crossjit_code : {{ *(.crossjit_code) }}
    .data : {{ *(.data .data.*) }}
    .bss : {{ *(.bss .bss.*) }}
}}
",
        base = code_base,
        load = layout.load_address,
        page = PAGE_SIZE,
        offset = code_base % PAGE_SIZE,
    )
}
