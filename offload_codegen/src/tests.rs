//! Tests for entry collection, device compilation and fat object embedding.

use std::collections::BTreeMap;

use object::read::RelocationTarget;
use object::{Object, ObjectSection, ObjectSymbol, SectionFlags, SymbolFlags, elf};
use offload_ir::module::{
    DeviceFunction, DeviceModule, FunctionKind, Visibility, is_portable_ir,
};
use offload_target::TargetId;
use offload_target::backend::HostBackend;
use offload_target::entry::{EntryFlags, OffloadEntry};
use offload_target::section::{DeviceSectionKey, ENTRIES_SECTION, ENTRY_NAMES_SECTION};
use offload_target::types::ObjectModule;

use crate::CodegenError;
use crate::collect::{
    DeclareTargetVariable, DeviceOnlyFunction, ExportKind, ExportList, MapKind, RegionKind,
    TargetRegion, TranslationUnit, collect_entries, region_entry_name,
};
use crate::device::{DeviceCompileOptions, DeviceObjectKind, compile_device};
use crate::embed::FatObjectEmbedder;
use crate::pipeline::{CompileOptions, compile_fat_object};
use crate::x86::{X86_64Backend, host_backend};

fn region(parent: &str, line: u32) -> TargetRegion {
    TargetRegion {
        parent: parent.into(),
        line,
        kind: RegionKind::Ordinary,
        device_code: vec![0xc3],
        references: Vec::new(),
    }
}

fn sample_unit() -> TranslationUnit {
    let mut tu = TranslationUnit::new("saxpy.c", 0x2a);
    let mut r = region("main", 12);
    r.references = vec!["scale".into(), "__rt_thread_id".into()];
    tu.regions.push(r);
    tu.functions.push(DeviceOnlyFunction {
        name: "scale".into(),
        device_code: vec![0x90, 0xc3],
        references: Vec::new(),
    });
    tu.variables.push(DeclareTargetVariable {
        name: "g".into(),
        size: 8,
        map: MapKind::To,
        init: Some(vec![42, 0, 0, 0, 0, 0, 0, 0]),
    });
    tu.variables.push(DeclareTargetVariable {
        name: "big".into(),
        size: 4096,
        map: MapKind::Link,
        init: None,
    });
    tu
}

fn nvptx() -> TargetId {
    TargetId::new("nvptx64-nvidia-cuda", "sm_80")
}

fn x86_device() -> TargetId {
    TargetId::new("x86_64-pc-linux-gnu", "")
}

fn runtime_for(target: TargetId) -> DeviceModule {
    let mut rt = DeviceModule::new(target);
    rt.add_function(DeviceFunction::definition(
        "__rt_thread_id",
        FunctionKind::Device,
        vec![0x31, 0xc0, 0xc3],
    ));
    rt
}

fn symbol_name(file: &object::File<'_>, target: RelocationTarget) -> String {
    match target {
        RelocationTarget::Symbol(idx) => file
            .symbol_by_index(idx)
            .and_then(|s| s.name().map(str::to_string))
            .unwrap_or_default(),
        _ => String::new(),
    }
}

#[test]
fn region_names_follow_file_parent_line() {
    let mut r = region("foo", 7);
    assert_eq!(region_entry_name(0xbeef, &r), "__omp_offloading_beef_foo_l7");
    r.kind = RegionKind::GlobalCtor;
    assert_eq!(region_entry_name(0xbeef, &r), "__omp_offloading_beef_foo_l7_ctor");
    r.kind = RegionKind::GlobalDtor;
    assert_eq!(region_entry_name(0xbeef, &r), "__omp_offloading_beef_foo_l7_dtor");
}

#[test]
fn collect_regions_then_variables() {
    let collected = collect_entries(&sample_unit()).unwrap();
    let summary: Vec<(String, u64, EntryFlags)> = collected
        .entries
        .iter()
        .map(|e| (e.name.clone(), e.size, e.flags))
        .collect();
    assert_eq!(
        summary,
        [
            ("__omp_offloading_2a_main_l12".to_string(), 0, EntryFlags::Region),
            ("g".to_string(), 8, EntryFlags::To),
            ("big".to_string(), 4096, EntryFlags::Link),
        ]
    );
    assert_eq!(
        collected.region_ids,
        [".__omp_offloading_2a_main_l12.region_id"]
    );
    assert_eq!(collected.entries[0].address, collected.region_ids[0]);
    assert_eq!(collected.entries[1].address, "g");
}

#[test]
fn collect_rejects_duplicates_and_zero_sized_variables() {
    let mut tu = sample_unit();
    tu.regions.push(region("main", 12));
    assert!(matches!(
        collect_entries(&tu),
        Err(CodegenError::DuplicateEntry(name)) if name == "__omp_offloading_2a_main_l12"
    ));

    let mut tu = TranslationUnit::new("a.c", 1);
    tu.variables.push(DeclareTargetVariable {
        name: "empty".into(),
        size: 0,
        map: MapKind::To,
        init: None,
    });
    assert!(matches!(collect_entries(&tu), Err(CodegenError::Entry(_))));
}

#[test]
fn translation_unit_from_json() {
    let tu = TranslationUnit::from_json(
        r#"{
            "source": "k.c",
            "file_id": 3,
            "regions": [{ "parent": "run", "line": 4, "kind": "global_dtor" }],
            "variables": [{ "name": "x", "size": 4, "map": "link" }]
        }"#,
    )
    .unwrap();
    assert_eq!(tu.regions[0].kind, RegionKind::GlobalDtor);
    assert_eq!(tu.variables[0].map, MapKind::Link);
    assert!(tu.functions.is_empty());
}

#[test]
fn export_list_uses_ref_pointer_for_link_variables() {
    let collected = collect_entries(&sample_unit()).unwrap();
    let exports = ExportList::from_entries(&collected.entries);
    let all: Vec<(&str, ExportKind)> = exports.iter().collect();
    assert_eq!(
        all,
        [
            ("__omp_offloading_2a_main_l12", ExportKind::Kernel),
            ("big_decl_tgt_ref_ptr", ExportKind::Variable { size: 8 }),
            ("g", ExportKind::Variable { size: 8 }),
        ]
    );
}

#[test]
fn device_compile_defers_gpu_targets_to_ir() {
    let tu = sample_unit();
    let exports = ExportList::from_entries(&collect_entries(&tu).unwrap().entries);
    let mut options = DeviceCompileOptions::new(nvptx());
    options.runtime_libraries.push(runtime_for(nvptx()));

    let object = compile_device(&tu, &exports, &options).unwrap();
    assert_eq!(object.kind, DeviceObjectKind::PortableIr);
    assert!(is_portable_ir(&object.bytes));

    let module = DeviceModule::from_bytes(&object.bytes).unwrap();
    let kernel = module.function("__omp_offloading_2a_main_l12").unwrap();
    assert_eq!(kernel.kind, FunctionKind::Kernel);
    assert_eq!(kernel.visibility, Visibility::Protected);
    assert_eq!(module.global("g").unwrap().visibility, Visibility::Protected);
    assert_eq!(module.global("big_decl_tgt_ref_ptr").unwrap().size, 8);
    assert_eq!(module.function("scale").unwrap().visibility, Visibility::Default);
    assert!(module.is_defined("__rt_thread_id"));
}

#[test]
fn device_compile_emits_native_objects_for_cpu_targets() {
    let tu = sample_unit();
    let exports = ExportList::from_entries(&collect_entries(&tu).unwrap().entries);
    let object = compile_device(&tu, &exports, &DeviceCompileOptions::new(x86_device())).unwrap();
    assert_eq!(object.kind, DeviceObjectKind::Native);

    let file = object::File::parse(&*object.bytes).unwrap();
    let kernel = file
        .symbols()
        .find(|s| s.name() == Ok("__omp_offloading_2a_main_l12"))
        .unwrap();
    match kernel.flags() {
        SymbolFlags::Elf { st_other, .. } => assert_eq!(st_other & 0x3, elf::STV_PROTECTED),
        other => panic!("unexpected flags {other:?}"),
    }
    // Left for the device linker.
    let rt = file.symbols().find(|s| s.name() == Ok("__rt_thread_id"));
    assert!(rt.is_none_or(|s| s.is_undefined()));

    let mut whole = DeviceCompileOptions::new(x86_device());
    whole.whole_program = true;
    let deferred = compile_device(&tu, &exports, &whole).unwrap();
    assert_eq!(deferred.kind, DeviceObjectKind::PortableIr);
}

#[test]
fn uninitialized_device_globals_take_no_file_space() {
    let mut tu = TranslationUnit::new("table.c", 0x33);
    tu.variables.push(DeclareTargetVariable {
        name: "table".into(),
        size: (1 << 32) + 8,
        map: MapKind::To,
        init: None,
    });
    let exports = ExportList::from_entries(&collect_entries(&tu).unwrap().entries);
    let object = compile_device(&tu, &exports, &DeviceCompileOptions::new(x86_device())).unwrap();
    assert!(object.bytes.len() < 4096, "object is {} bytes", object.bytes.len());

    let file = object::File::parse(&*object.bytes).unwrap();
    let table = file.symbols().find(|s| s.name() == Ok("table")).unwrap();
    assert_eq!(table.size(), (1 << 32) + 8);
    let section = file.section_by_index(table.section_index().unwrap()).unwrap();
    assert_eq!(section.kind(), object::SectionKind::UninitializedData);
    match table.flags() {
        SymbolFlags::Elf { st_other, .. } => assert_eq!(st_other & 0x3, elf::STV_PROTECTED),
        other => panic!("unexpected flags {other:?}"),
    }
}

#[test]
fn fat_object_checks_exports_against_host_entries() {
    let tu = sample_unit();
    let backend = X86_64Backend::default();
    let mut host_entries = collect_entries(&tu).unwrap().entries;
    host_entries.push(
        OffloadEntry::function(".h.region_id", "__omp_offloading_2a_main_l99", EntryFlags::Region)
            .unwrap(),
    );
    let mut runtime_libraries = BTreeMap::new();
    runtime_libraries.insert(nvptx(), vec![runtime_for(nvptx())]);
    let options = CompileOptions {
        targets: vec![nvptx()],
        runtime_libraries,
        host_entries: Some(host_entries),
        ..CompileOptions::default()
    };
    let result = compile_fat_object(&tu, &ObjectModule::default(), &backend, &options);
    assert!(matches!(
        result,
        Err(CodegenError::MissingExport { ref target, ref symbol })
            if *target == nvptx() && symbol == "__omp_offloading_2a_main_l99"
    ));

    let matching = CompileOptions {
        host_entries: Some(collect_entries(&tu).unwrap().entries),
        ..options
    };
    assert!(compile_fat_object(&tu, &ObjectModule::default(), &backend, &matching).is_ok());
}

#[test]
fn device_compile_checks_host_exports() {
    let tu = sample_unit();
    let mut entries = collect_entries(&tu).unwrap().entries;
    entries.push(OffloadEntry::function("h", "not_on_device", EntryFlags::Region).unwrap());
    let missing = compile_device(
        &tu,
        &ExportList::from_entries(&entries),
        &DeviceCompileOptions::new(nvptx()),
    );
    assert!(matches!(
        missing,
        Err(CodegenError::MissingExport { symbol, .. }) if symbol == "not_on_device"
    ));

    let mut entries = collect_entries(&tu).unwrap().entries;
    entries[1].size = 16;
    let mismatch = compile_device(
        &tu,
        &ExportList::from_entries(&entries),
        &DeviceCompileOptions::new(nvptx()),
    );
    assert!(matches!(
        mismatch,
        Err(CodegenError::ExportMismatch { symbol, .. }) if symbol == "g"
    ));

    // A runtime library hiding a symbol the host relies on.
    let mut hiding = DeviceModule::new(nvptx());
    let mut scale = DeviceFunction::declaration("__omp_offloading_2a_main_l12");
    scale.visibility = Visibility::Hidden;
    hiding.add_function(scale);
    hiding.add_function(DeviceFunction::definition(
        "__rt_thread_id",
        FunctionKind::Device,
        vec![0xc3],
    ));
    let mut options = DeviceCompileOptions::new(nvptx());
    options.runtime_libraries.push(hiding);
    let entries = collect_entries(&tu).unwrap().entries;
    let hidden = compile_device(&tu, &ExportList::from_entries(&entries), &options);
    assert!(matches!(
        hidden,
        Err(CodegenError::ExportMismatch { reason, .. }) if reason.contains("hidden")
    ));
}

#[test]
fn embed_writes_entries_and_device_sections() {
    let tu = sample_unit();
    let backend = X86_64Backend::default();
    let mut runtime_libraries = BTreeMap::new();
    runtime_libraries.insert(nvptx(), vec![runtime_for(nvptx())]);
    let options = CompileOptions {
        targets: vec![nvptx(), x86_device()],
        whole_program: false,
        runtime_libraries,
        host_entries: None,
    };
    let fat = compile_fat_object(&tu, &ObjectModule::default(), &backend, &options).unwrap();
    assert_eq!(fat.entries.len(), 3);
    assert_eq!(fat.device_objects[0].target, nvptx());
    assert_eq!(fat.device_objects[1].kind, DeviceObjectKind::Native);

    let file = object::File::parse(&*fat.bytes).unwrap();
    let entries = file.section_by_name(ENTRIES_SECTION).unwrap();
    assert_eq!(entries.data().unwrap().len(), 3 * 32);
    assert_eq!(&entries.data().unwrap()[32 + 16..32 + 24], &8u64.to_le_bytes());

    let mut relocs: Vec<(u64, String)> = entries
        .relocations()
        .map(|(offset, r)| (offset, symbol_name(&file, r.target())))
        .collect();
    relocs.sort();
    assert_eq!(relocs.len(), 6);
    assert_eq!(relocs[0], (0, ".__omp_offloading_2a_main_l12.region_id".to_string()));
    assert_eq!(relocs[1], (8, format!("{ENTRY_NAMES_SECTION}.0")));
    assert_eq!(relocs[2], (32, "g".to_string()));
    assert_eq!(relocs[4], (64, "big".to_string()));

    let names = file.section_by_name(ENTRY_NAMES_SECTION).unwrap();
    assert!(names.data().unwrap().starts_with(b"__omp_offloading_2a_main_l12\0g\0big\0"));

    let region_id = file
        .symbols()
        .find(|s| s.name() == Ok(".__omp_offloading_2a_main_l12.region_id"))
        .unwrap();
    assert!(region_id.is_weak());
    assert_eq!(region_id.size(), 1);

    let key = DeviceSectionKey::new(nvptx(), Some("2a".into()));
    let device = file.section_by_name(&key.section_name()).unwrap();
    assert_eq!(device.data().unwrap(), &fat.device_objects[0].bytes[..]);
    match device.flags() {
        SectionFlags::Elf { sh_flags } => {
            assert_ne!(sh_flags & u64::from(elf::SHF_EXCLUDE), 0);
            assert_eq!(sh_flags & u64::from(elf::SHF_ALLOC), 0);
        }
        other => panic!("unexpected flags {other:?}"),
    }
}

#[test]
fn embed_without_entries_has_no_entries_section() {
    let backend = X86_64Backend::default();
    let tu = TranslationUnit::new("host_only.c", 9);
    let fat = compile_fat_object(
        &tu,
        &ObjectModule::default(),
        &backend,
        &CompileOptions::default(),
    )
    .unwrap();
    let file = object::File::parse(&*fat.bytes).unwrap();
    assert!(file.section_by_name(ENTRIES_SECTION).is_none());
}

#[test]
fn embed_rejects_two_objects_for_one_target() {
    let backend = X86_64Backend::default();
    let tu = sample_unit();
    let exports = ExportList::from_entries(&collect_entries(&tu).unwrap().entries);
    let mut options = DeviceCompileOptions::new(nvptx());
    options.runtime_libraries.push(runtime_for(nvptx()));
    let object = compile_device(&tu, &exports, &options).unwrap();
    let result = FatObjectEmbedder::new(&backend).embed(
        &ObjectModule::default(),
        &collect_entries(&tu).unwrap(),
        &[object.clone(), object],
    );
    assert!(matches!(result, Err(CodegenError::DuplicateTarget(t)) if t == nvptx()));
}

#[test]
fn descriptor_stub_relocations() {
    let backend = X86_64Backend::default();
    let stub = backend.descriptor_stub(".omp_offloading.descriptor_reg", "desc", "__tgt_register_lib");
    assert_eq!(stub.code.len(), 12);
    assert_eq!(stub.relocations[0].offset, 3);
    assert_eq!(stub.relocations[0].symbol, "desc");
    assert_eq!(stub.relocations[1].offset, 8);
    assert_eq!(stub.relocations[1].symbol, "__tgt_register_lib");
}

#[test]
fn host_backend_selection() {
    assert_eq!(
        host_backend("x86_64-unknown-linux-gnu").unwrap().triple(),
        "x86_64-unknown-linux-gnu"
    );
    assert!(host_backend("aarch64-unknown-linux-gnu").is_err());
    assert!(host_backend("x86_64-pc-windows-msvc").is_err());
}
