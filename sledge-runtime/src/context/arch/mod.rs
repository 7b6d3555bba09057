//! Architecture dispatch. Only `x86_64` is implemented — see
//! SPEC_FULL.md §9 / Non-goals for the `aarch64` omission.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("sledge-runtime's context module only implements x86_64 register save/restore");
