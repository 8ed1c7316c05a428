//! Architecture dispatch for the fiber context-switch primitive.
//!
//! Only downward-growing-stack, register-based-ABI architectures are
//! supported, per the runtime's documented requirement; anything else
//! fails the build here rather than producing a runtime that silently
//! corrupts memory on first context switch.

#[cfg(target_arch = "x86_64")]
mod x86_64_layout {
    /// Bytes reserved for the fabricated first-entry frame: six
    /// callee-saved GPRs (rbp, rbx, r12-r15) plus a return address, as
    /// laid out by `weave_fiber_switch` in `arch/x86_64.s`.
    pub const FRAME_SIZE: usize = 7 * 8;
    /// Offset of the stashed fiber-context pointer (lands in r12).
    pub const CONTEXT_PTR_OFFSET: usize = 3 * 8;
    /// Offset of the return address consumed by the final `ret`.
    pub const RETURN_ADDR_OFFSET: usize = 6 * 8;
}

#[cfg(target_arch = "aarch64")]
mod aarch64_layout {
    /// Bytes reserved for the fabricated first-entry frame: x19-x28, fp,
    /// lr, as laid out by `weave_fiber_switch` in `arch/aarch64.s`
    /// (112 bytes is what the prologue actually subtracts from sp).
    pub const FRAME_SIZE: usize = 112;
    /// Offset of the stashed fiber-context pointer (lands in x19).
    pub const CONTEXT_PTR_OFFSET: usize = 0;
    /// Offset of the saved link register, branched to by `ret`.
    pub const RETURN_ADDR_OFFSET: usize = 88;
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!(
    "weave's fiber scheduler requires a downward-growing-stack, \
     register-based-calling-convention architecture (x86_64 or aarch64); \
     this target is not supported"
);

extern "C" {
    /// Saves the six/eight callee-saved registers of the calling fiber
    /// onto its own stack, records the resulting stack pointer at
    /// `*old_sp_slot`, switches `sp`/`rsp` to `new_sp`, and restores the
    /// registers found there (or the fabricated initial frame built by
    /// [`init_stack`]).
    pub fn weave_fiber_switch(old_sp_slot: *mut *mut u8, new_sp: *mut u8);

    /// Entry point landed on by a freshly-switched-to fiber the first
    /// time it runs; defined in `scheduler.rs` and called (never
    /// returning) from the arch-specific trampoline with the fiber's
    /// context pointer in the first argument register.
    fn weave_fiber_start(context: *mut u8) -> !;
}

/// Required alignment of the stack pointer handed to a fiber at first
/// entry, per both the SysV and AAPCS64 ABIs.
pub const STACK_ALIGNMENT: usize = 16;

/// Builds the fabricated first-entry frame at the top of `stack` (which
/// must already be `STACK_ALIGNMENT`-aligned at `stack.len()`), stashing
/// `context_ptr` where the trampoline will find it, and returns the stack
/// pointer to hand to [`weave_fiber_switch`].
///
/// # Safety
/// `stack` must be valid, writable, and large enough to hold the
/// architecture's frame size plus whatever the fiber's own execution will
/// use.
pub unsafe fn init_stack(stack: *mut u8, stack_len: usize, context_ptr: *mut u8) -> *mut u8 {
    #[cfg(target_arch = "x86_64")]
    use x86_64_layout::{CONTEXT_PTR_OFFSET, FRAME_SIZE, RETURN_ADDR_OFFSET};
    #[cfg(target_arch = "aarch64")]
    use aarch64_layout::{CONTEXT_PTR_OFFSET, FRAME_SIZE, RETURN_ADDR_OFFSET};

    let top = stack.add(stack_len);
    let aligned_top = (top as usize & !(STACK_ALIGNMENT - 1)) as *mut u8;
    let frame = aligned_top.sub(FRAME_SIZE);

    std::ptr::write_bytes(frame, 0, FRAME_SIZE);
    (frame.add(CONTEXT_PTR_OFFSET) as *mut usize).write(context_ptr as usize);
    (frame.add(RETURN_ADDR_OFFSET) as *mut usize).write(weave_fiber_trampoline_addr());

    frame
}

fn weave_fiber_trampoline_addr() -> usize {
    extern "C" {
        fn weave_fiber_trampoline();
    }
    weave_fiber_trampoline as usize
}
