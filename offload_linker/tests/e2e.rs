//! End-to-end tests: translation unit → fat object → wrapper → host link.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use object::{Object, ObjectSection, ObjectSymbol};
use offload_codegen::collect::{
    DeclareTargetVariable, MapKind, RegionKind, TargetRegion, TranslationUnit,
};
use offload_codegen::pipeline::{CompileOptions, compile_fat_object};
use offload_codegen::x86::X86_64Backend;
use offload_linker::scan::scan_object;
use offload_linker::wrapper::WRAPPER_OBJECT;
use offload_linker::{LinkerWrapper, WrapperConfig, WrapperError};
use offload_target::TargetId;
use offload_target::entry::EntryFlags;
use offload_target::section::{DeviceSectionKey, ENTRIES_SECTION};
use offload_target::types::ObjectModule;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Host linker stand-in: records its arguments next to itself.
fn fake_host_linker(dir: &Path) -> PathBuf {
    script(
        dir,
        "host-ld",
        &format!("echo \"$@\" > {}\n", dir.join("host-ld.args").display()),
    )
}

/// Device linker stand-in: writes a fixed image to the `-o` path.
const FAKE_DEVICE_LINKER: &str = r#"
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "-o" ]; then out="$2"; shift; fi
    shift
done
printf 'device-image' > "$out"
"#;

fn kernel_unit(file_id: u64) -> TranslationUnit {
    let mut tu = TranslationUnit::new("app.c", file_id);
    tu.regions.push(TargetRegion {
        parent: "k".into(),
        line: 5,
        kind: RegionKind::Ordinary,
        device_code: vec![0xc3],
        references: Vec::new(),
    });
    tu.variables.push(DeclareTargetVariable {
        name: "g".into(),
        size: 8,
        map: MapKind::To,
        init: Some(vec![42, 0, 0, 0, 0, 0, 0, 0]),
    });
    tu
}

fn write_fat(dir: &Path, name: &str, tu: &TranslationUnit, targets: &[TargetId]) -> PathBuf {
    let options = CompileOptions {
        targets: targets.to_vec(),
        whole_program: false,
        runtime_libraries: BTreeMap::new(),
        host_entries: None,
    };
    let fat = compile_fat_object(tu, &ObjectModule::default(), &X86_64Backend::default(), &options)
        .unwrap();
    let path = dir.join(name);
    fs::write(&path, &fat.bytes).unwrap();
    path
}

fn config(dir: &Path, host_args: Vec<String>) -> WrapperConfig {
    WrapperConfig {
        linker_path: fake_host_linker(dir),
        host_args,
        temp_dir: Some(dir.to_path_buf()),
        save_temps: true,
        ..WrapperConfig::default()
    }
}

fn descriptor_image_count(wrapper: &[u8]) -> i32 {
    let file = object::File::parse(wrapper).unwrap();
    let sym = file
        .symbols()
        .find(|s| s.name() == Ok(".omp_offloading.descriptor"))
        .unwrap();
    let section = file.section_by_index(sym.section_index().unwrap()).unwrap();
    let data = section.data().unwrap();
    let at = sym.address() as usize;
    i32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

#[test]
fn single_target_with_kernel_and_variable() {
    let dir = tempfile::tempdir().unwrap();
    let target = TargetId::new("nvptx64-nvidia-cuda", "sm_80");
    let fat = write_fat(dir.path(), "app.o", &kernel_unit(0xa1), std::slice::from_ref(&target));

    let scan = scan_object("app.o", &fs::read(&fat).unwrap()).unwrap();
    let entries: Vec<(&str, u64, EntryFlags)> = scan
        .entries
        .iter()
        .map(|e| (e.name.as_str(), e.size, e.flags))
        .collect();
    assert_eq!(
        entries,
        [
            ("__omp_offloading_a1_k_l5", 0, EntryFlags::Region),
            ("g", 8, EntryFlags::To),
        ]
    );
    let fat_bytes = fs::read(&fat).unwrap();
    let raw = object::File::parse(&*fat_bytes).unwrap();
    let device_sections: Vec<String> = raw
        .sections()
        .filter_map(|s| s.name().ok().map(str::to_string))
        .filter(|n| DeviceSectionKey::parse(n).ok().flatten().is_some())
        .collect();
    assert_eq!(
        device_sections,
        [DeviceSectionKey::new(target.clone(), Some("a1".into())).section_name()]
    );

    let args = vec![fat.display().to_string(), "-o".into(), "app".into()];
    let outcome = LinkerWrapper::new(config(dir.path(), args))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(outcome.entries.len(), 2);
    assert_eq!(outcome.images.len(), 1);
    assert_eq!(outcome.images[0].target, target);

    let temps = outcome.temps.unwrap();
    let wrapper = fs::read(temps.join(WRAPPER_OBJECT)).unwrap();
    assert_eq!(descriptor_image_count(&wrapper), 1);

    let host_args = fs::read_to_string(dir.path().join("host-ld.args")).unwrap();
    assert!(host_args.starts_with(&format!("{} -o app ", fat.display())));
    assert!(host_args.trim_end().ends_with(WRAPPER_OBJECT));
    fs::remove_dir_all(temps).unwrap();
}

#[test]
fn two_targets_without_entries_still_register_both() {
    let dir = tempfile::tempdir().unwrap();
    let targets = [
        TargetId::new("nvptx64-nvidia-cuda", "sm_70"),
        TargetId::new("amdgcn-amd-amdhsa", "gfx90a:xnack+"),
    ];
    let tu = TranslationUnit::new("empty.c", 0xb2);
    let fat = write_fat(dir.path(), "empty.o", &tu, &targets);

    let outcome = LinkerWrapper::new(config(dir.path(), vec![fat.display().to_string()]))
        .unwrap()
        .run()
        .unwrap();
    assert!(outcome.entries.is_empty());
    let linked: Vec<TargetId> = outcome.images.iter().map(|i| i.target.clone()).collect();
    assert_eq!(linked, targets);

    let temps = outcome.temps.unwrap();
    let wrapper = fs::read(temps.join(WRAPPER_OBJECT)).unwrap();
    assert_eq!(descriptor_image_count(&wrapper), 2);
    let file = object::File::parse(&*wrapper).unwrap();
    let entries = file.section_by_name(ENTRIES_SECTION).unwrap();
    assert_eq!(entries.size(), 0);
    fs::remove_dir_all(temps).unwrap();
}

#[test]
fn missing_toolchain_stops_before_host_link() {
    let dir = tempfile::tempdir().unwrap();
    let fat = write_fat(
        dir.path(),
        "app.o",
        &kernel_unit(0xc3),
        &[TargetId::new("nvptx64-nvidia-cuda", "sm_80")],
    );
    let mut config = config(
        dir.path(),
        vec![fat.display().to_string(), "-o".into(), "app".into()],
    );
    config
        .offload_targets
        .push("x86_64-pc-linux-gnu".parse().unwrap());
    config
        .device_linkers
        .insert("x86_64-pc-linux-gnu".into(), dir.path().join("no-such-linker"));

    let err = LinkerWrapper::new(config).unwrap().run().unwrap_err();
    assert!(
        matches!(err, WrapperError::MissingToolchain { ref target, .. } if target.triple == "x86_64-pc-linux-gnu"),
        "unexpected error: {err}"
    );
    assert_eq!(err.exit_code(), 1);
    assert!(!dir.path().join("host-ld.args").exists());
    assert!(!dir.path().join("app").exists());
}

#[test]
fn native_device_link_and_failure_status() {
    let dir = tempfile::tempdir().unwrap();
    let target = TargetId::new("x86_64-pc-linux-gnu", "");
    let fat = write_fat(dir.path(), "app.o", &kernel_unit(0xd4), std::slice::from_ref(&target));

    let mut good = config(dir.path(), vec![fat.display().to_string()]);
    good.device_linkers.insert(
        target.triple.clone(),
        script(dir.path(), "dev-ld", FAKE_DEVICE_LINKER),
    );
    let outcome = LinkerWrapper::new(good).unwrap().run().unwrap();
    assert_eq!(outcome.images[0].bytes, b"device-image");
    let device_command = outcome.commands[0].to_string();
    assert!(device_command.contains(" -shared -o "), "{device_command}");
    fs::remove_dir_all(outcome.temps.unwrap()).unwrap();
    fs::remove_file(dir.path().join("host-ld.args")).unwrap();

    let mut bad = config(dir.path(), vec![fat.display().to_string()]);
    bad.device_linkers.insert(
        target.triple.clone(),
        script(dir.path(), "dev-ld-fail", "echo 'undefined symbol: foo' >&2\nexit 7\n"),
    );
    let err = LinkerWrapper::new(bad).unwrap().run().unwrap_err();
    assert_eq!(err.exit_code(), 7);
    assert!(err.to_string().contains("undefined symbol: foo"));
    assert!(!dir.path().join("host-ld.args").exists());
}

/// Work directories created under `dir`.
fn work_dirs(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("offload-link-"))
        })
        .collect()
}

#[test]
fn save_temps_keeps_work_dir_when_host_link_fails() {
    let dir = tempfile::tempdir().unwrap();
    let fat = write_fat(
        dir.path(),
        "app.o",
        &kernel_unit(0x1a),
        &[TargetId::new("nvptx64-nvidia-cuda", "sm_80")],
    );
    let temps = dir.path().join("temps");
    fs::create_dir(&temps).unwrap();

    let mut cfg = WrapperConfig {
        linker_path: script(dir.path(), "host-ld-fail", "exit 3\n"),
        host_args: vec![fat.display().to_string()],
        temp_dir: Some(temps.clone()),
        save_temps: true,
        ..WrapperConfig::default()
    };
    let err = LinkerWrapper::new(cfg.clone()).unwrap().run().unwrap_err();
    assert!(matches!(err, WrapperError::HostLinkFailed(_)), "unexpected error: {err}");
    assert_eq!(err.exit_code(), 3);
    let kept = work_dirs(&temps);
    assert_eq!(kept.len(), 1);
    assert!(kept[0].join(WRAPPER_OBJECT).is_file());
    fs::remove_dir_all(&kept[0]).unwrap();

    cfg.save_temps = false;
    LinkerWrapper::new(cfg).unwrap().run().unwrap_err();
    assert!(work_dirs(&temps).is_empty());
}

#[test]
fn first_failing_target_sets_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let first = TargetId::new("x86_64-pc-linux-gnu", "");
    let second = TargetId::new("aarch64-unknown-linux-gnu", "");
    let fat = write_fat(
        dir.path(),
        "app.o",
        &kernel_unit(0x2b),
        &[first.clone(), second.clone()],
    );

    let mut cfg = config(dir.path(), vec![fat.display().to_string()]);
    cfg.jobs = Some(2);
    // The first target fails last; its status still wins.
    cfg.device_linkers.insert(
        first.triple.clone(),
        script(dir.path(), "dev-ld-slow", "sleep 1\nexit 5\n"),
    );
    cfg.device_linkers.insert(
        second.triple.clone(),
        script(dir.path(), "dev-ld-fast", "exit 9\n"),
    );
    let err = LinkerWrapper::new(cfg).unwrap().run().unwrap_err();
    assert!(
        matches!(err, WrapperError::DeviceLinkFailed { ref target, .. } if *target == first),
        "unexpected error: {err}"
    );
    assert_eq!(err.exit_code(), 5);
    assert!(!dir.path().join("host-ld.args").exists());
}

#[test]
fn dry_run_prints_plan_only() {
    let dir = tempfile::tempdir().unwrap();
    let target = TargetId::new("x86_64-pc-linux-gnu", "");
    let fat = write_fat(dir.path(), "app.o", &kernel_unit(0xe5), std::slice::from_ref(&target));
    let mut cfg = config(dir.path(), vec![fat.display().to_string()]);
    cfg.dry_run = true;
    cfg.device_linkers.insert(
        target.triple.clone(),
        script(dir.path(), "dev-ld", "exit 1\n"),
    );
    let outcome = LinkerWrapper::new(cfg).unwrap().run().unwrap();
    assert_eq!(outcome.commands.len(), 2);
    assert!(outcome.images.is_empty());
    assert!(!dir.path().join("host-ld.args").exists());
}

const C_RUNTIME: &str = r#"
#include <stdint.h>
#include <stdio.h>
#include <string.h>

struct entry { void *addr; const char *name; size_t size; int32_t flags; int32_t reserved; };
struct image { const char *start; const char *end; struct entry *begin; struct entry *stop; };
struct descriptor { int32_t count; struct image *images; struct entry *begin; struct entry *stop; };

long g = 42;
static int registered;
static int failures;

static void check(int cond, const char *what) {
    if (!cond) {
        printf("FAIL: %s\n", what);
        failures++;
    }
}

void __tgt_register_lib(struct descriptor *d) {
    registered++;
    check(d->count == 1, "image count");
    check(d->images[0].end - d->images[0].start > 4, "image size");
    check(memcmp(d->images[0].start, "\x7fOIR", 4) == 0, "image magic");
    check(d->images[0].begin == d->begin && d->images[0].stop == d->stop, "shared entry range");
    check(d->stop - d->begin == 2, "entry count");
    check(strcmp(d->begin[0].name, "__omp_offloading_f6_k_l5") == 0, "kernel name");
    check(d->begin[0].size == 0, "kernel size");
    check(strcmp(d->begin[1].name, "g") == 0, "variable name");
    check(d->begin[1].addr == (void *)&g, "variable address");
    check(d->begin[1].size == 8, "variable size");
}

void __tgt_unregister_lib(struct descriptor *d) {
    (void)d;
}

int main(void) {
    check(registered == 1, "registered once before main");
    if (failures == 0) {
        printf("PASS\n");
        return 0;
    }
    return 1;
}
"#;

#[test]
fn link_and_run() {
    let dir = tempfile::tempdir().unwrap();
    let fat = write_fat(
        dir.path(),
        "app.o",
        &kernel_unit(0xf6),
        &[TargetId::new("nvptx64-nvidia-cuda", "sm_80")],
    );
    let runtime = dir.path().join("runtime.c");
    fs::write(&runtime, C_RUNTIME).unwrap();
    let exe = dir.path().join("app");

    let cfg = WrapperConfig {
        linker_path: PathBuf::from("cc"),
        host_args: vec![
            runtime.display().to_string(),
            fat.display().to_string(),
            "-o".into(),
            exe.display().to_string(),
        ],
        ..WrapperConfig::default()
    };
    LinkerWrapper::new(cfg)
        .unwrap()
        .run()
        .unwrap_or_else(|e| panic!("wrapper failed: {e}"));

    let run = Command::new(&exe)
        .output()
        .expect("failed to run test binary");
    let stdout = String::from_utf8_lossy(&run.stdout);
    assert!(
        run.status.success(),
        "test binary failed: {stdout}{}",
        String::from_utf8_lossy(&run.stderr)
    );
    assert!(stdout.contains("PASS"), "unexpected output: {stdout}");
}
