//! The profile-to-rewrite feedback loop, end to end through the public API.

use std::fs;

use mpk_untrusted_patch::{
    Block, Function, Inst, Module, Op, Operand, PatchOptions, PatchPass,
};

fn instrumented_module() -> Module {
    let mut module = Module::default();
    // foo: six allocation sites across two blocks, so the profiled id (5)
    // lands on the last hook of the second block.
    let mut blocks = Vec::new();
    let mut insts = Vec::new();
    for value in 1..=3u32 {
        insts.push(Inst::call(
            Some(value),
            "__rust_alloc",
            vec![Operand::Imm(64), Operand::Imm(8)],
        ));
        insts.push(Inst::call(
            None,
            "allocHook",
            vec![
                Operand::Value(value),
                Operand::Imm(64),
                Operand::Undef,
                Operand::Undef,
                Operand::Undef,
            ],
        ));
    }
    blocks.push(Block::new(insts, vec![1]));
    let mut insts = Vec::new();
    for value in 4..=6u32 {
        let callee = if value == 6 {
            "__rust_alloc_zeroed"
        } else {
            "__rust_alloc"
        };
        insts.push(Inst::call(
            Some(value),
            callee,
            vec![Operand::Imm(64), Operand::Imm(8)],
        ));
        insts.push(Inst::call(
            None,
            "allocHook",
            vec![
                Operand::Value(value),
                Operand::Imm(64),
                Operand::Undef,
                Operand::Undef,
                Operand::Undef,
            ],
        ));
    }
    blocks.push(Block::named("exit", insts, vec![]));
    module.functions.push(Function::new("foo", blocks));
    module.declare_function("allocHook");
    module.declare_function("__rust_alloc");
    module.declare_function("__rust_alloc_zeroed");
    module
}

#[test]
fn recorded_fault_redirects_the_matching_allocator_call() {
    let dir = std::env::temp_dir().join(format!("mpk-patch-flow-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("faulting-allocs-1234-00000000deadbeef.json"),
        r#"[{"id":5,"pkey":2,"bbName":"exit","funcName":"foo","isRealloc":false}]"#,
    )
    .unwrap();

    let options = PatchOptions::from_args(&[
        format!("mpk-test-profile-path={}", dir.display()),
        "mpk-verbose-patching=false".to_owned(),
    ])
    .unwrap();

    let mut module = instrumented_module();
    let stats = PatchPass::new(options).run(&mut module).unwrap();
    fs::remove_dir_all(&dir).unwrap();

    assert_eq!(stats.hooks_seen, 6);
    assert_eq!(stats.rewritten, 1);

    // Only the sixth site (id 5, a zeroed allocation) changed callees.
    let function = module.function("foo").unwrap();
    let callees: Vec<_> = function
        .blocks
        .iter()
        .flat_map(|block| &block.insts)
        .filter_map(|inst| match &inst.op {
            Op::Call { callee, .. } if callee.starts_with("__rust") => Some(callee.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        callees,
        vec![
            "__rust_alloc",
            "__rust_alloc",
            "__rust_alloc",
            "__rust_alloc",
            "__rust_alloc",
            "__rust_untrusted_alloc_zeroed",
        ]
    );
    assert!(module.has_function("__rust_untrusted_alloc_zeroed"));

    // Ids were written in traversal order within each block.
    let Op::Call { args, .. } = &function.blocks[1].insts[5].op else {
        panic!()
    };
    assert_eq!(args[2], Operand::Imm(5));
    assert_eq!(args[3], Operand::Str("exit".into()));
    assert_eq!(args[4], Operand::Str("foo".into()));
}

#[test]
fn patching_twice_from_the_same_profile_is_stable() {
    let profile = std::env::temp_dir().join(format!("mpk-patch-stable-{}.json", std::process::id()));
    fs::write(
        &profile,
        r#"[{"id":0,"pkey":1,"bbName":"block0","funcName":"foo","isRealloc":false}]"#,
    )
    .unwrap();

    let run_once = || {
        let options = PatchOptions::from_args(&[
            format!("mpk-test-profile-path={}", profile.display()),
            "mpk-verbose-patching=false".to_owned(),
        ])
        .unwrap();
        let mut module = instrumented_module();
        PatchPass::new(options).run(&mut module).unwrap();
        serde_json::to_string_pretty(&module).unwrap()
    };

    let first = run_once();
    let second = run_once();
    fs::remove_file(&profile).unwrap();
    assert_eq!(first, second);
}
