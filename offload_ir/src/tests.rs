//! Tests for the device IR container, verifier and linker.

use std::collections::BTreeSet;

use offload_target::TargetId;

use crate::link::{self, LinkError};
use crate::module::{
    DeviceFunction, DeviceGlobal, DeviceModule, FunctionKind, IrFormatError, Linkage, Visibility,
    is_portable_ir,
};
use crate::verifier::{Location, verify_module};

fn nvptx() -> TargetId {
    TargetId::new("nvptx64-nvidia-cuda", "sm_80")
}

fn kernel(name: &str) -> DeviceFunction {
    DeviceFunction::definition(name, FunctionKind::Kernel, vec![0x01, 0x02])
}

fn helper(name: &str) -> DeviceFunction {
    DeviceFunction::definition(name, FunctionKind::Device, vec![0x03])
}

#[test]
fn serialize_and_sniff() {
    let mut m = DeviceModule::new(nvptx());
    m.add_function(kernel("k").with_references(["g"]));
    m.add_global(DeviceGlobal::definition("g", 4, Some(vec![1, 2, 3, 4])));

    let bytes = m.to_bytes().unwrap();
    assert!(is_portable_ir(&bytes));
    assert!(!is_portable_ir(b"\x7fELF\x02\x01"));
    assert_eq!(DeviceModule::from_bytes(&bytes).unwrap(), m);
}

#[test]
fn decode_rejects_foreign_bytes() {
    assert!(matches!(
        DeviceModule::from_bytes(b"\x7fELF"),
        Err(IrFormatError::BadMagic)
    ));
    assert!(matches!(
        DeviceModule::from_bytes(b"\x7fOIR\x01"),
        Err(IrFormatError::Truncated)
    ));
    assert!(matches!(
        DeviceModule::from_bytes(b"\x7fOIR\x09\x00\x00\x00{}"),
        Err(IrFormatError::UnsupportedVersion(9))
    ));
    assert!(matches!(
        DeviceModule::from_bytes(b"\x7fOIR\x01\x00\x00\x00{"),
        Err(IrFormatError::Json(_))
    ));
}

#[test]
fn verifier_collects_all_errors() {
    let mut m = DeviceModule::new(nvptx());
    let mut k = kernel("k").with_references(["missing"]);
    k.linkage = Linkage::Internal;
    m.add_function(k);
    m.add_function(helper("k"));
    m.add_global(DeviceGlobal::definition("g", 4, Some(vec![0; 2])));
    m.add_global(DeviceGlobal::definition("z", 0, None));

    let result = verify_module(&m);
    assert!(!result.is_ok());
    let messages: Vec<String> = result.errors.iter().map(|e| e.to_string()).collect();
    assert!(messages.contains(&"[module] duplicate symbol @k".to_string()));
    assert!(messages.contains(&"[func @k] kernel must have external linkage".to_string()));
    assert!(messages.contains(&"[func @k] reference to unknown symbol @missing".to_string()));
    assert!(messages.iter().any(|m| m.contains("initializer is 2 bytes")));
    assert!(
        result
            .errors
            .iter()
            .any(|e| e.location == Location::Global("z".into()))
    );
    assert!(result.to_string().starts_with("verification failed with 5 error(s)"));
}

#[test]
fn link_resolves_declarations_and_weak_definitions() {
    let mut a = DeviceModule::new(nvptx());
    a.add_function(kernel("k").with_references(["f", "g"]));
    a.add_function(DeviceFunction::declaration("f"));
    a.add_global(DeviceGlobal::declaration("g", 8));
    let mut weak = helper("f");
    weak.linkage = Linkage::Weak;
    a.add_function(DeviceFunction {
        name: "w".into(),
        ..weak.clone()
    });

    let mut b = DeviceModule::new(nvptx());
    let mut strong_f = helper("f");
    strong_f.visibility = Visibility::Protected;
    b.add_function(strong_f);
    b.add_global(DeviceGlobal::definition("g", 8, None));
    b.add_function(helper("w"));

    let linked = link::link_modules(&nvptx(), vec![a, b]).unwrap();
    assert!(link::unresolved(&linked).is_empty());
    let f = linked.function("f").unwrap();
    assert!(!f.is_declaration());
    assert_eq!(f.visibility, Visibility::Protected);
    assert_eq!(linked.function("w").unwrap().linkage, Linkage::External);
    assert!(!linked.global("g").unwrap().declaration);
}

#[test]
fn link_rejects_conflicts() {
    let mut a = DeviceModule::new(nvptx());
    a.add_function(helper("f"));
    let mut b = DeviceModule::new(nvptx());
    b.add_function(helper("f"));
    assert!(matches!(
        link::link_modules(&nvptx(), vec![a.clone(), b]),
        Err(LinkError::DuplicateSymbol(name)) if name == "f"
    ));

    let mut c = DeviceModule::new(nvptx());
    c.add_global(DeviceGlobal::definition("f", 4, None));
    assert!(matches!(
        link::link_modules(&nvptx(), vec![a.clone(), c]),
        Err(LinkError::KindMismatch(_))
    ));

    let other = DeviceModule::new(TargetId::new("nvptx64-nvidia-cuda", "sm_90"));
    assert!(matches!(
        link::link_modules(&nvptx(), vec![a, other]),
        Err(LinkError::TargetMismatch { .. })
    ));
}

#[test]
fn link_renames_clashing_internal_symbols() {
    let mut a = DeviceModule::new(nvptx());
    let mut local = helper("helper");
    local.linkage = Linkage::Internal;
    a.add_function(kernel("ka").with_references(["helper"]));
    a.add_function(local.clone());

    let mut b = DeviceModule::new(nvptx());
    b.add_function(kernel("kb").with_references(["helper"]));
    b.add_function(local);

    let linked = link::link_modules(&nvptx(), vec![a, b]).unwrap();
    assert_eq!(linked.functions.len(), 4);
    assert_eq!(linked.function("ka").unwrap().references, vec!["helper"]);
    assert_eq!(linked.function("kb").unwrap().references, vec!["helper.1"]);
    assert!(linked.function("helper.1").is_some());
}

#[test]
fn lazy_link_pulls_only_needed_libraries() {
    let mut m = DeviceModule::new(nvptx());
    m.add_function(kernel("k").with_references(["__rt_sync"]));
    m.add_function(DeviceFunction::declaration("__rt_sync"));

    let mut sync = DeviceModule::new(nvptx());
    sync.add_function(helper("__rt_sync").with_references(["__rt_barrier"]));
    sync.add_function(DeviceFunction::declaration("__rt_barrier"));
    let mut barrier = DeviceModule::new(nvptx());
    barrier.add_function(helper("__rt_barrier"));
    let mut unused = DeviceModule::new(nvptx());
    unused.add_function(helper("__rt_print"));

    let (linked, pulled) = link::link_lazy(m, &[unused, barrier, sync]).unwrap();
    assert_eq!(pulled, 2);
    assert!(linked.is_defined("__rt_sync"));
    assert!(linked.is_defined("__rt_barrier"));
    assert!(linked.function("__rt_print").is_none());
    assert!(link::unresolved(&linked).is_empty());
}

#[test]
fn internalize_and_strip_from_roots() {
    let mut m = DeviceModule::new(nvptx());
    m.add_function(kernel("k").with_references(["used"]));
    m.add_function(helper("used"));
    m.add_function(helper("dead"));
    m.add_global(DeviceGlobal::definition("var", 8, None));
    m.add_global(DeviceGlobal::definition("scratch", 8, None));
    m.add_function(DeviceFunction::declaration("never_called"));

    let roots: BTreeSet<String> = ["var".to_string()].into();
    link::internalize(&mut m, &roots);
    assert_eq!(m.function("k").unwrap().linkage, Linkage::External);
    assert_eq!(m.function("used").unwrap().linkage, Linkage::Internal);
    assert_eq!(m.global("var").unwrap().linkage, Linkage::External);

    let removed = link::strip_dead(&mut m, &roots);
    assert_eq!(removed, 3);
    let names: Vec<&str> = m.functions.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["k", "used"]);
    assert!(m.global("scratch").is_none());
    assert!(m.global("var").is_some());
}

#[test]
fn unresolved_lists_undefined_references() {
    let mut m = DeviceModule::new(nvptx());
    m.add_function(kernel("k").with_references(["helper", "printf"]));
    m.add_function(helper("helper"));
    m.add_function(DeviceFunction::declaration("malloc"));
    m.add_global(DeviceGlobal::declaration("counter", 4));

    assert_eq!(link::unresolved(&m), ["counter", "malloc", "printf"]);
}
