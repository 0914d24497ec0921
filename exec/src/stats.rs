use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use tcg_backend::HostCodeGen;

use crate::SharedState;

/// Translation-side counters, shared by all vCPUs.
#[derive(Debug, Default)]
pub struct SharedStats {
    pub translations: AtomicU64,
    pub translated_insns: AtomicU64,
    pub host_bytes: AtomicU64,
    pub guest_bytes: AtomicU64,
    pub invalidations: AtomicU64,
    pub flushes: AtomicU64,
    pub chain_links: AtomicU64,
    pub restores: AtomicU64,
}

impl SharedStats {
    pub(crate) fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Per-vCPU execution counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecStats {
    pub loop_iters: u64,
    pub tb_exec: u64,
    /// TB entries reached through a patched link.
    pub chained: u64,
    pub jc_hits: u64,
    pub hash_hits: u64,
    pub translations: u64,
    pub exits_requested: u64,
    pub exceptions: u64,
    pub atomic_steps: u64,
}

impl fmt::Display for ExecStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "dispatcher iterations {}", self.loop_iters)?;
        writeln!(f, "TBs executed          {}", self.tb_exec)?;
        writeln!(f, "  via chain           {}", self.chained)?;
        writeln!(f, "jump cache hits       {}", self.jc_hits)?;
        writeln!(f, "hash table hits       {}", self.hash_hits)?;
        writeln!(f, "translations          {}", self.translations)?;
        writeln!(f, "requested exits       {}", self.exits_requested)?;
        writeln!(f, "exceptions            {}", self.exceptions)?;
        write!(f, "atomic steps          {}", self.atomic_steps)
    }
}

fn load(c: &AtomicU64) -> u64 {
    c.load(Ordering::Relaxed)
}

impl<B: HostCodeGen> SharedState<B> {
    /// Human-readable summary of the translation cache.
    pub fn dump_exec_info(&self) -> String {
        let s = &self.stats;
        let store = &self.tb_store;
        let (used, capacity) = self.code_usage();
        let tbs = store.len();
        let translations = load(&s.translations);
        let avg = |total: u64| if translations == 0 { 0 } else { total / translations };

        let mut out = String::new();
        let _ = writeln!(out, "Translation buffer state ({} host):", self.backend.name());
        let _ = writeln!(out, "gen code size       {used}/{capacity}");
        let _ = writeln!(out, "TB count            {tbs}/{}", store.capacity());
        let _ = writeln!(out, "TB avg guest size   {} bytes", avg(load(&s.guest_bytes)));
        let _ = writeln!(out, "TB avg host size    {} bytes", avg(load(&s.host_bytes)));
        let _ = writeln!(out, "code pages          {}", store.num_code_pages());
        let _ = writeln!(out, "translations        {translations}");
        let _ = writeln!(out, "translated insns    {}", load(&s.translated_insns));
        let _ = writeln!(out, "chain links         {}", load(&s.chain_links));
        let _ = writeln!(out, "invalidations       {}", load(&s.invalidations));
        let _ = writeln!(out, "state restores      {}", load(&s.restores));
        let _ = writeln!(out, "cache generation    {}", store.generation());
        let _ = write!(out, "flush count         {}", load(&s.flushes));
        out
    }
}
