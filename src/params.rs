//! Heap parameters: validated configuration plus the `MICRO_`
//! environment overrides.  Bad values are clamped with a warning, so
//! a heap never fails to initialise because of configuration.
use crate::headers::ALIGNED_POOL;
use crate::tiny::MAX_SMALL_THRESHOLD;

/// Hard bound on the arena count; the effective default is the
/// hardware concurrency rounded down to a power of two.
pub const MAX_ARENAS: u32 = 32;

/// Default page size for the non-OS page providers.
pub const DEFAULT_PAGE_SIZE: u32 = ALIGNED_POOL as u32;
pub const MIN_PAGE_SIZE: u32 = DEFAULT_PAGE_SIZE;
pub const MAX_PAGE_SIZE: u32 = 65536;

pub const DEFAULT_GROW_FACTOR: f64 = 1.6;

/// Log levels, mirroring the `log_level` parameter (0 disables).
pub const LOG_NONE: u32 = 0;
pub const LOG_CRITICAL: u32 = 1;
pub const LOG_WARNING: u32 = 2;
pub const LOG_INFO: u32 = 3;

/// Which page provider backs the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderType {
    /// mmap/munmap.
    Os,
    /// mmap/munmap over a region reserved up front.
    OsPrealloc,
    /// Carve pages from a caller-supplied memory block.
    Memory,
    /// Carve pages from a growable memory-mapped temporary file.
    File,
}

impl ProviderType {
    pub fn from_u32(value: u32) -> Option<ProviderType> {
        match value {
            0 => Some(ProviderType::Os),
            1 => Some(ProviderType::OsPrealloc),
            2 => Some(ProviderType::Memory),
            3 => Some(ProviderType::File),
            _ => None,
        }
    }
}

/// Statistics print triggers (bitmask).
pub const STATS_ON_EXIT: u32 = 1;
pub const STATS_ON_TIME: u32 = 2;
pub const STATS_ON_BYTES: u32 = 4;

/// File provider flags.
pub const FILE_STATIC_SIZE: u32 = 0;
pub const FILE_GROWING: u32 = 1;

/// Memory manager parameters.  A heap copies its parameters at
/// construction; they cannot change afterwards.
#[derive(Clone, Debug)]
pub struct Parameters {
    /// Requests at or below this many bytes go to the tiny pools.
    pub small_alloc_threshold: u32,

    /// Allow serving small objects from the radix tree when the tiny
    /// pools cannot carve a new block.
    pub allow_small_from_radix: bool,

    /// Scan sibling arenas before asking the provider for pages.
    pub deplete_arenas: bool,

    /// Number of arenas (power of two).
    pub max_arenas: u32,

    /// Hard cap on live bytes; allocations beyond it return null.
    /// Zero disables the limit.
    pub memory_limit: u64,

    /// Free page bytes kept for reuse.  Values at or below 100 are a
    /// percentage of currently used memory; larger values are an
    /// absolute byte count.
    pub backend_memory: u64,

    /// 0 none, 1 critical, 2 warning, 3 info.
    pub log_level: u32,

    /// strftime-style pattern stamped on statistics dumps.
    pub log_date_format: String,

    pub provider_type: ProviderType,

    /// Page size used by the non-OS providers.
    pub page_size: u32,

    /// Backing block for the fixed-memory provider.
    pub page_memory_provider: *mut u8,

    /// Size of the fixed-memory block, preallocation, or initial file
    /// size, depending on the provider.
    pub page_memory_size: u64,

    /// Fall back to OS pages when the chosen provider is exhausted.
    pub allow_os_page_alloc: bool,

    /// Growth factor of the file provider when `FILE_GROWING` is set.
    pub grow_factor: f64,

    /// File name (or prefix, when a directory is given) for the file
    /// provider.  Empty selects an anonymous temporary file.
    pub page_file_provider: String,

    /// Directory for the file provider's backing file.
    pub page_file_provider_dir: String,

    /// Combination of `FILE_STATIC_SIZE` / `FILE_GROWING`.
    pub page_file_flags: u32,

    /// Statistics destination: empty, a path, "stdout" or "stderr".
    pub print_stats: String,

    /// Combination of `STATS_ON_EXIT` / `STATS_ON_TIME` / `STATS_ON_BYTES`.
    pub print_stats_trigger: u32,

    /// Milliseconds between dumps for `STATS_ON_TIME`.
    pub print_stats_ms: u32,

    /// Allocated bytes between dumps for `STATS_ON_BYTES`.
    pub print_stats_bytes: u32,

    /// Dump in CSV rather than human-readable form.
    pub print_stats_csv: bool,
}

// The raw `page_memory_provider` block is only dereferenced by the
// memory provider, which owns it for the heap's lifetime.
unsafe impl Send for Parameters {}
unsafe impl Sync for Parameters {}

fn default_arenas() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    if cores <= 1 {
        return 1;
    }
    let mut arenas = cores;
    if arenas & (arenas - 1) != 0 {
        arenas = 1 << (31 - arenas.leading_zeros());
    }
    arenas.min(MAX_ARENAS)
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            small_alloc_threshold: MAX_SMALL_THRESHOLD,
            allow_small_from_radix: true,
            deplete_arenas: true,
            max_arenas: default_arenas(),
            memory_limit: 0,
            backend_memory: 0,
            log_level: LOG_NONE,
            log_date_format: "%Y-%m-%d %H:%M:%S".to_string(),
            provider_type: ProviderType::Os,
            page_size: DEFAULT_PAGE_SIZE,
            page_memory_provider: std::ptr::null_mut(),
            page_memory_size: 0,
            allow_os_page_alloc: true,
            grow_factor: DEFAULT_GROW_FACTOR,
            page_file_provider: String::new(),
            page_file_provider_dir: String::new(),
            page_file_flags: FILE_STATIC_SIZE,
            print_stats: String::new(),
            print_stats_trigger: 0,
            print_stats_ms: 0,
            print_stats_bytes: 0,
            print_stats_csv: false,
        }
    }
}

impl Parameters {
    /// Returns a copy with every field clamped to a valid value,
    /// warning (through the `log` facade) about replaced ones.
    pub fn validate(&self) -> Parameters {
        let mut p = self.clone();
        let warn = p.log_level >= LOG_WARNING;

        if p.small_alloc_threshold > MAX_SMALL_THRESHOLD {
            if warn {
                log::warn!(
                    "invalid small_alloc_threshold value: {}",
                    p.small_alloc_threshold
                );
            }
            p.small_alloc_threshold = MAX_SMALL_THRESHOLD;
        }
        p.small_alloc_threshold &= !7u32;

        if p.max_arenas != 0 && p.max_arenas & (p.max_arenas - 1) != 0 {
            p.max_arenas = 1 << (31 - p.max_arenas.leading_zeros());
        }
        if p.max_arenas > MAX_ARENAS {
            if warn {
                log::warn!("max_arenas value too high: {}", p.max_arenas);
            }
            p.max_arenas = MAX_ARENAS;
        }
        if p.max_arenas == 0 {
            if warn {
                log::warn!("max_arenas value is 0: set to 1");
            }
            p.max_arenas = 1;
        }

        if p.page_size == 0
            || p.page_size & (p.page_size - 1) != 0
            || p.page_size < MIN_PAGE_SIZE
            || p.page_size > MAX_PAGE_SIZE
        {
            if warn {
                log::warn!("invalid page_size value: {}", p.page_size);
            }
            p.page_size = DEFAULT_PAGE_SIZE;
        }

        if p.page_file_flags > FILE_GROWING {
            p.page_file_flags = FILE_GROWING;
        }

        if p.grow_factor <= 0.0 || p.grow_factor > 8.0 {
            if warn {
                log::warn!("invalid grow_factor value: {}", p.grow_factor);
            }
            p.grow_factor = DEFAULT_GROW_FACTOR;
        }

        if p.print_stats_trigger > (STATS_ON_EXIT | STATS_ON_TIME | STATS_ON_BYTES) {
            if warn {
                log::warn!("invalid print_stats_trigger value: {}", p.print_stats_trigger);
            }
            p.print_stats_trigger = 0;
        }

        if p.log_level > LOG_INFO {
            p.log_level = LOG_INFO;
        }

        p
    }

    /// Builds parameters from `MICRO_`-prefixed environment
    /// variables.  The result is not validated.
    pub fn from_env() -> Parameters {
        fn get(name: &str) -> Option<String> {
            std::env::var(name).ok()
        }
        fn get_u64(name: &str) -> Option<u64> {
            get(name)?.trim().parse().ok()
        }
        fn get_u32(name: &str) -> Option<u32> {
            get(name)?.trim().parse().ok()
        }
        fn get_bool(name: &str) -> Option<bool> {
            get_u32(name).map(|v| v != 0)
        }

        let mut p = Parameters::default();
        if let Some(v) = get_u32("MICRO_SMALL_ALLOC_THRESHOLD") {
            p.small_alloc_threshold = v;
        }
        if let Some(v) = get_bool("MICRO_SMALL_ALLOC_FROM_RADIX_TREE") {
            p.allow_small_from_radix = v;
        }
        if let Some(v) = get_bool("MICRO_DEPLETE_ARENAS") {
            p.deplete_arenas = v;
        }
        if let Some(v) = get_u32("MICRO_MAX_ARENAS") {
            p.max_arenas = v;
        }
        if let Some(v) = get_u64("MICRO_MEMORY_LIMIT") {
            p.memory_limit = v;
        }
        if let Some(v) = get_u64("MICRO_BACKEND_MEMORY") {
            p.backend_memory = v;
        }
        if let Some(v) = get_u32("MICRO_LOG_LEVEL") {
            p.log_level = v;
        }
        if let Some(v) = get("MICRO_LOG_DATE_FORMAT") {
            p.log_date_format = v;
        }
        if let Some(v) = get_u32("MICRO_PROVIDER_TYPE") {
            if let Some(ty) = ProviderType::from_u32(v) {
                p.provider_type = ty;
            }
        }
        if let Some(v) = get_u32("MICRO_PAGE_SIZE") {
            p.page_size = v;
        }
        if let Some(v) = get("MICRO_GROW_FACTOR") {
            if let Ok(f) = v.trim().parse::<f64>() {
                p.grow_factor = f;
            }
        }
        if let Some(v) = get_u64("MICRO_PAGE_MEMORY_SIZE") {
            p.page_memory_size = v;
        }
        if let Some(v) = get("MICRO_PAGE_FILE_PROVIDER") {
            p.page_file_provider = v;
        }
        if let Some(v) = get("MICRO_PAGE_FILE_PROVIDER_DIR") {
            p.page_file_provider_dir = v;
        }
        if let Some(v) = get_u32("MICRO_PAGE_FILE_FLAGS") {
            p.page_file_flags = v;
        }
        if let Some(v) = get_bool("MICRO_ALLOW_OS_PAGE_ALLOC") {
            p.allow_os_page_alloc = v;
        }
        if let Some(v) = get("MICRO_PRINT_STATS") {
            p.print_stats = v;
        }
        if let Some(v) = get_u32("MICRO_PRINT_STATS_TRIGGER") {
            p.print_stats_trigger = v;
        }
        if let Some(v) = get_u32("MICRO_PRINT_STATS_MS") {
            p.print_stats_ms = v;
        }
        if let Some(v) = get_u32("MICRO_PRINT_STATS_BYTES") {
            p.print_stats_bytes = v;
        }
        if let Some(v) = get_bool("MICRO_PRINT_STATS_CSV") {
            p.print_stats_csv = v;
        }
        p
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_already_valid() {
        let p = Parameters::default();
        let v = p.validate();

        assert_eq!(v.small_alloc_threshold, p.small_alloc_threshold);
        assert_eq!(v.max_arenas, p.max_arenas);
        assert!(v.max_arenas.is_power_of_two());
        assert_eq!(v.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn bad_values_are_clamped() {
        let mut p = Parameters::default();
        p.small_alloc_threshold = 100_000;
        p.max_arenas = 7;
        p.page_size = 12345;
        p.grow_factor = 50.0;
        p.print_stats_trigger = 255;
        p.log_level = 77;

        let v = p.validate();
        assert_eq!(v.small_alloc_threshold, MAX_SMALL_THRESHOLD & !7);
        assert_eq!(v.max_arenas, 4);
        assert_eq!(v.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(v.grow_factor, DEFAULT_GROW_FACTOR);
        assert_eq!(v.print_stats_trigger, 0);
        assert_eq!(v.log_level, LOG_INFO);
    }

    #[test]
    fn zero_arenas_becomes_one() {
        let mut p = Parameters::default();
        p.max_arenas = 0;
        assert_eq!(p.validate().max_arenas, 1);
    }

    #[test]
    fn environment_overrides() {
        std::env::set_var("MICRO_SMALL_ALLOC_THRESHOLD", "320");
        std::env::set_var("MICRO_DEPLETE_ARENAS", "0");
        std::env::set_var("MICRO_BACKEND_MEMORY", "1048576");
        std::env::set_var("MICRO_PROVIDER_TYPE", "1");

        let p = Parameters::from_env();

        std::env::remove_var("MICRO_SMALL_ALLOC_THRESHOLD");
        std::env::remove_var("MICRO_DEPLETE_ARENAS");
        std::env::remove_var("MICRO_BACKEND_MEMORY");
        std::env::remove_var("MICRO_PROVIDER_TYPE");

        assert_eq!(p.small_alloc_threshold, 320);
        assert!(!p.deplete_arenas);
        assert_eq!(p.backend_memory, 1_048_576);
        assert_eq!(p.provider_type, ProviderType::OsPrealloc);
    }

    #[test]
    fn threshold_rounds_down_to_eight() {
        let mut p = Parameters::default();
        p.small_alloc_threshold = 213;
        assert_eq!(p.validate().small_alloc_threshold, 208);
    }
}
