use std::env;

// Register layouts differ per architecture, but the BPF target hides the host
// arch. Expose it as `bpf_target_arch` the same way aya-ebpf does.
fn main() {
    let arch = env::var("CARGO_CFG_BPF_TARGET_ARCH").unwrap_or_else(|_| {
        env::var("HOST")
            .ok()
            .and_then(|host| host.split('-').next().map(str::to_owned))
            .unwrap_or_default()
    });
    println!("cargo:rustc-cfg=bpf_target_arch=\"{arch}\"");
    println!(
        "cargo::rustc-check-cfg=cfg(bpf_target_arch, values(\"x86_64\", \"riscv64\", \"aarch64\", \"arm\", \"powerpc64\", \"s390x\", \"mips\", \"loongarch64\"))"
    );
    println!("cargo:rerun-if-env-changed=CARGO_CFG_BPF_TARGET_ARCH");
}
