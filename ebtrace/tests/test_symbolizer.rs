use std::sync::Arc;

use ebtrace::domain::Pid;
use ebtrace::registry::Registry;
use ebtrace::symbolization::{
    ProcImageLoader, ProcMaps, Resolver, ResolverConfig, SymbolCache, UNKNOWN_SYMBOL,
};

#[inline(never)]
fn symbolization_marker(x: u64) -> u64 {
    std::hint::black_box(x).wrapping_mul(31).rotate_left(7)
}

fn marker_address() -> u64 {
    symbolization_marker as fn(u64) -> u64 as usize as u64
}

#[test]
fn test_resolves_own_function() {
    assert_ne!(symbolization_marker(3), 0);
    let resolver = Resolver::new(&ResolverConfig::default());
    let addr = marker_address();

    let frames = resolver.resolve(Pid::current(), &[addr, addr + 1]);
    assert_eq!(frames.len(), 2);
    println!("{}", frames[0].format(0));

    assert!(
        frames[0].name().ends_with("symbolization_marker"),
        "resolved to {}",
        frames[0].name()
    );
    assert_eq!(frames[0].offset, 0);
    assert_eq!(frames[1].name(), frames[0].name());
    assert_eq!(frames[1].offset, 1);

    let image = frames[0].image.as_ref().expect("frame has no image");
    let exe = std::env::current_exe().unwrap();
    assert_eq!(image.path.file_name(), exe.file_name());
}

#[test]
fn test_line_info_points_at_source() {
    let config = ResolverConfig { line_info: true, ..ResolverConfig::default() };
    let resolver = Resolver::new(&config);
    let frame = &resolver.resolve(Pid::current(), &[marker_address()])[0];

    let location = frame.location.as_ref().expect("no line info for a debug build");
    assert!(location.file.ends_with("tests/test_symbolizer.rs"), "unexpected file {}", location.file);
    assert!(std::path::Path::new(&location.file).is_absolute());
    assert!(location.line > 0);
    println!("{}", frame.format(0));
}

#[test]
fn test_second_resolve_hits_cache() {
    let cache = Arc::new(SymbolCache::new(64 << 20));
    let resolver = Resolver::with_sources(
        ProcMaps::default(),
        ProcImageLoader::new("/proc", false),
        Arc::clone(&cache),
    );

    let first = resolver.resolve(Pid::current(), &[marker_address()]);
    let second = resolver.resolve(Pid::current(), &[marker_address()]);
    assert_eq!(first, second);

    let stats = cache.stats();
    assert!(stats.misses >= 1);
    assert!(stats.hits >= 1);
}

#[test]
fn test_gone_process_yields_unknown() {
    let resolver = Resolver::new(&ResolverConfig::default());
    let frames = resolver.resolve(Pid(i32::MAX), &[marker_address(), 0x1000]);
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.name() == UNKNOWN_SYMBOL));
    assert!(resolver.resolve(Pid(i32::MAX), &[]).is_empty());
}

#[test]
fn test_resolve_for_live_identity() {
    let registry = Registry::new();
    let me = registry.lookup(Pid::current()).expect("own process not in /proc");
    let resolver = Resolver::new(&ResolverConfig::default());

    let frames = resolver.resolve_for(&registry, &me, &[marker_address()]);
    assert!(frames[0].name().ends_with("symbolization_marker"));
}
