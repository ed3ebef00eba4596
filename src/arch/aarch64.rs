// src/arch/aarch64.rs
//! AArch64 キャッシュメンテナンス
//!
//! URPC の共有フレームは通常メモリとしてマップされるため、書き込み後に
//! データキャッシュを明示的にメインメモリへ書き戻す必要があります。

use crate::constants::CACHE_LINE_SIZE;

/// Write a range of dirty cache lines back to main memory.
///
/// The range is extended to cache-line boundaries. On non-AArch64 hosts this
/// degrades to a compiler fence so hosted tests observe the same ordering.
#[inline]
pub fn dcache_wb_range(start: usize, len: usize) {
    #[cfg(target_arch = "aarch64")]
    {
        let first = start & !(CACHE_LINE_SIZE - 1);
        let end = start + len;
        let mut line = first;
        while line < end {
            // SAFETY: dc cvac は任意のアドレスに対して安全（権限チェックのみ）
            unsafe {
                core::arch::asm!(
                    "dc cvac, {0}",
                    in(reg) line,
                    options(nostack, preserves_flags)
                );
            }
            line += CACHE_LINE_SIZE;
        }
        // SAFETY: barrier instruction, no memory operands
        unsafe {
            core::arch::asm!("dsb sy", options(nostack, preserves_flags));
        }
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (start, len, CACHE_LINE_SIZE);
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}
