//! X86-64 host backend.

use offload_target::backend::{EmitError, HostBackend};
use offload_target::reloc::{RelocKind, Relocation};
use offload_target::types::{CompiledFunction, ObjectModule};

use crate::emit::{ElfTarget, emit_object};

/// X86-64 ELF host backend.
#[derive(Debug, Clone)]
pub struct X86_64Backend {
    triple: String,
}

impl X86_64Backend {
    pub fn new(triple: impl Into<String>) -> Self {
        Self {
            triple: triple.into(),
        }
    }
}

impl Default for X86_64Backend {
    fn default() -> Self {
        Self::new("x86_64-unknown-linux-gnu")
    }
}

impl HostBackend for X86_64Backend {
    fn triple(&self) -> &str {
        &self.triple
    }

    fn emit_object(&self, module: &ObjectModule) -> Result<Vec<u8>, EmitError> {
        emit_object(ElfTarget::X86_64, module)
    }

    fn descriptor_stub(&self, name: &str, descriptor: &str, callee: &str) -> CompiledFunction {
        //   lea rdi, [rip+descriptor]   ; first argument
        //   jmp callee                  ; tail call, stack alignment unchanged
        let code = vec![
            0x48, 0x8d, 0x3d, 0x00, 0x00, 0x00, 0x00, // lea rdi, [rip+0]
            0xe9, 0x00, 0x00, 0x00, 0x00, // jmp rel32
        ];
        let relocations = vec![
            Relocation::new(3, descriptor, RelocKind::PcRel),
            Relocation::new(8, callee, RelocKind::Call),
        ];
        CompiledFunction::local(name, code, relocations)
    }
}

/// Pick the host backend for a triple.
pub fn host_backend(triple: &str) -> Result<Box<dyn HostBackend>, EmitError> {
    let arch = triple.split('-').next().unwrap_or_default();
    let os_ok = triple.contains("linux") || triple.contains("elf") || triple.contains("freebsd");
    match arch {
        "x86_64" if os_ok => Ok(Box::new(X86_64Backend::new(triple))),
        _ => Err(EmitError::UnsupportedTarget(triple.to_string())),
    }
}
