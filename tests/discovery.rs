//! Probe discovery, grouping, and source emission over synthetic images.

mod support;

use anyhow::Result;
use pretty_assertions::assert_eq;
use stapsdt::Context;
use support::*;
use tempfile::tempdir;

fn context_for(fixture: ElfFixture, filename: &str) -> Result<(tempfile::TempDir, Context)> {
    let dir = tempdir()?;
    let bin = fixture.write_to(dir.path(), filename);
    let context = Context::from_binary(bin.to_str().expect("utf-8 tempdir path"));

    assert!(context.loaded());

    Ok((dir, context))
}

#[test]
fn discovers_a_probe_in_a_shared_object() -> Result<()> {
    let fixture = ElfFixture::shared().note(
        "myapp",
        "req_start",
        0x1234,
        0x2000,
        "-4@%eax 8@(%rdi)",
    );
    let (_dir, context) = context_for(fixture, "libapp.so")?;

    assert_eq!(context.num_probes(), 1);

    let probe = context.get("req_start").expect("probe discovered");

    assert_eq!(probe.provider(), "myapp");
    assert_eq!(probe.name(), "req_start");
    assert_eq!(probe.semaphore(), 0x2000);
    assert!(probe.need_enable());
    assert!(probe.in_shared_object()?);

    assert_eq!(probe.num_locations(), 1);
    assert_eq!(probe.address(0), Some(0x1234));
    assert_eq!(probe.num_arguments(), 2);

    let args = probe.locations()[0].arguments();
    assert_eq!(args[0].arg_size(), -4);
    assert_eq!(args[0].ctype(), "int32_t");
    assert_eq!(args[1].arg_size(), 8);
    assert_eq!(args[1].ctype(), "uint64_t");

    Ok(())
}

#[test]
fn groups_locations_by_provider_and_name() -> Result<()> {
    // Three notes, two identities. The repeated identity contributes a
    // second location, and its differing semaphore is ignored.
    let fixture = ElfFixture::exec()
        .note("myapp", "req_start", 0x400100, 0x601000, "-4@%eax")
        .note("myapp", "req_end", 0x400180, 0, "")
        .note("myapp", "req_start", 0x400200, 0x601999, "-4@%ebx");
    let (_dir, context) = context_for(fixture, "app")?;

    assert_eq!(context.num_probes(), 2);

    let probe = context.get("req_start").unwrap();
    assert_eq!(probe.num_locations(), 2);
    assert_eq!(probe.semaphore(), 0x601000);
    assert_eq!(probe.address(0), Some(0x400100));
    assert_eq!(probe.address(1), Some(0x400200));

    // Discovery order follows note order.
    assert_eq!(context.get_idx("req_start"), Some(0));
    assert_eq!(context.get_idx("req_end"), Some(1));
    assert_eq!(context.get_idx("missing"), None);
    assert!(context.get("missing").is_none());

    Ok(())
}

#[test]
fn unresolvable_binary_leaves_the_context_unloaded() {
    let context = Context::from_binary("/nonexistent/path/to/app");

    assert!(!context.loaded());
    assert_eq!(context.num_probes(), 0);
}

#[test]
fn emits_one_thunk_per_location() -> Result<()> {
    let fixture = ElfFixture::exec()
        .note("myapp", "tick", 0x400100, 0, "")
        .note("myapp", "tick", 0x400200, 0, "")
        .note("myapp", "tick", 0x400300, 0, "");
    let (_dir, context) = context_for(fixture, "app")?;

    let thunks = context.get("tick").unwrap().usdt_thunks("hello");
    let lines: Vec<&str> = thunks.lines().collect();

    assert_eq!(lines.len(), 3);
    assert_eq!(
        lines[0],
        "int hello_thunk_0(struct pt_regs *ctx) { return hello(ctx, 0); }"
    );
    assert_eq!(
        lines[2],
        "int hello_thunk_2(struct pt_regs *ctx) { return hello(ctx, 2); }"
    );

    Ok(())
}

#[test]
fn getarg_for_a_single_location_is_straight_line() -> Result<()> {
    let fixture = ElfFixture::exec().note("myapp", "req_start", 0x400100, 0, "-4@%eax");
    let (_dir, context) = context_for(fixture, "app")?;

    let source = context.get("req_start").unwrap().usdt_getarg(None)?;

    assert_eq!(
        source,
        "#include <uapi/linux/ptrace.h>\n\
         static inline int32_t _bpf_readarg_req_start_1(struct pt_regs *ctx) {\n  \
         int32_t result = 0x0;\n  \
         result = (int32_t)ctx->ax;\n  \
         return result;\n}\n"
    );

    Ok(())
}

#[test]
fn getarg_for_several_locations_dispatches_on_the_instruction_pointer() -> Result<()> {
    // A fixed-position binary, so the probe addresses pass through
    // resolution unchanged and no pid is needed.
    let fixture = ElfFixture::exec()
        .note("myapp", "multi", 0x400100, 0, "-4@%eax")
        .note("myapp", "multi", 0x400200, 0, "8@%rdi");
    let (_dir, context) = context_for(fixture, "app")?;

    let source = context.get("multi").unwrap().usdt_getarg(None)?;

    assert_eq!(
        source,
        "#include <uapi/linux/ptrace.h>\n\
         static inline uint64_t _bpf_readarg_multi_1(struct pt_regs *ctx) {\n  \
         uint64_t result = 0x0;\n  \
         if (ctx->ip == 0x400100ULL) { result = (int32_t)ctx->ax; }\n  \
         if (ctx->ip == 0x400200ULL) { result = (uint64_t)ctx->di; }\n  \
         return result;\n}\n"
    );

    Ok(())
}

#[test]
fn getarg_emits_nothing_for_an_argumentless_probe() -> Result<()> {
    let fixture = ElfFixture::exec().note("myapp", "tick", 0x400100, 0, "");
    let (_dir, context) = context_for(fixture, "app")?;

    assert_eq!(context.get("tick").unwrap().usdt_getarg(None)?, "");

    Ok(())
}

#[test]
fn getarg_fails_when_a_location_dropped_an_argument() -> Result<()> {
    // The second location's token does not parse, so its argument list
    // is shorter; emitting readers for it would misalign.
    let fixture = ElfFixture::exec()
        .note("myapp", "req_start", 0x400100, 0, "-4@%eax")
        .note("myapp", "req_start", 0x400200, 0, "-4@%nosuchreg");
    let (_dir, context) = context_for(fixture, "app")?;

    let probe = context.get("req_start").unwrap();

    assert!(probe.usdt_getarg(None).is_err());
    assert!(probe.usdt_cases(None).is_err());

    Ok(())
}

#[test]
fn cases_declare_the_widest_type_per_slot() -> Result<()> {
    let fixture = ElfFixture::exec()
        .note("myapp", "multi", 0x400100, 0, "-4@%eax 8@$7")
        .note("myapp", "multi", 0x400200, 0, "8@%rdi -2@$3");
    let (_dir, context) = context_for(fixture, "app")?;

    let source = context.get("multi").unwrap().usdt_cases(None)?;

    assert_eq!(
        source,
        "uint64_t arg1 = 0;\n\
         uint64_t arg2 = 0;\n\
         if (__loc_id == 0) {\n  \
         arg1 = (int32_t)ctx->ax;\n  \
         arg2 = 7;\n\
         }\n\
         if (__loc_id == 1) {\n  \
         arg1 = (uint64_t)ctx->di;\n  \
         arg2 = 3;\n\
         }\n"
    );

    Ok(())
}
