//! Compile and run each script under `demos/` through the public
//! `lumenc::compile` / `Vm::interpret` pair and check the outcome each one
//! is meant to demonstrate.

use lumen_runtime::{Vm, VmOptions};
use lumenc::CompilerConfig;
use std::path::PathBuf;

fn demo_source(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos").join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("can't read {path:?}: {e}"))
}

#[test]
fn closure_counter_compiles_and_runs_to_completion() {
    let mut vm = Vm::new(VmOptions::default());
    let function = lumenc::compile(&demo_source("closure_counter.lumen"), &mut vm, &CompilerConfig::default())
        .expect("closure_counter.lumen compiles");
    vm.interpret(function).expect("closure_counter.lumen runs without a runtime error");
}

#[test]
fn inheritance_super_compiles_and_runs_to_completion() {
    let mut vm = Vm::new(VmOptions::default());
    let function = lumenc::compile(&demo_source("inheritance_super.lumen"), &mut vm, &CompilerConfig::default())
        .expect("inheritance_super.lumen compiles");
    vm.interpret(function).expect("inheritance_super.lumen runs without a runtime error");
}

#[test]
fn list_ops_compiles_and_runs_to_completion() {
    let mut vm = Vm::new(VmOptions::default());
    let function = lumenc::compile(&demo_source("list_ops.lumen"), &mut vm, &CompilerConfig::default())
        .expect("list_ops.lumen compiles");
    vm.interpret(function).expect("list_ops.lumen runs without a runtime error");
}

#[test]
fn match_default_compiles_and_runs_to_completion() {
    let mut vm = Vm::new(VmOptions::default());
    let function = lumenc::compile(&demo_source("match_default.lumen"), &mut vm, &CompilerConfig::default())
        .expect("match_default.lumen compiles");
    vm.interpret(function).expect("match_default.lumen runs without a runtime error");
}

#[test]
fn runtime_error_backtrace_compiles_but_raises_a_runtime_error() {
    let mut vm = Vm::new(VmOptions::default());
    let function = lumenc::compile(&demo_source("runtime_error_backtrace.lumen"), &mut vm, &CompilerConfig::default())
        .expect("runtime_error_backtrace.lumen compiles");
    let err = vm.interpret(function).expect_err("division by zero raises a runtime error");
    assert!(err.message.contains("Division by zero"));
    assert!(err.backtrace.iter().any(|f| f.function_name.as_deref() == Some("g")));
}

#[test]
fn self_reference_initializer_fails_to_compile() {
    let mut vm = Vm::new(VmOptions::default());
    let errs = lumenc::compile(&demo_source("self_reference_initializer.lumen"), &mut vm, &CompilerConfig::default())
        .expect_err("a local can't read itself in its own initializer");
    assert!(errs.errors().iter().any(|e| e.message.contains("own initializer")));
}

#[test]
fn top_level_self_reference_compiles_but_fails_at_runtime() {
    let mut vm = Vm::new(VmOptions::default());
    let function = lumenc::compile(&demo_source("top_level_self_reference.lumen"), &mut vm, &CompilerConfig::default())
        .expect("a global self-reference is not caught at compile time");
    let err = vm.interpret(function).expect_err("the read executes before the global is defined");
    assert!(err.message.contains("Undefined variable"));
}
