//! Compiled manifest: the manifest in an immutable, index-addressable,
//! serializable form (`spec.md` §3, §4.3).

mod compile;
mod compiled;
pub mod raw;
mod step;

pub use compiled::{parse_and_compile, CompiledManifest, COMPILED_MANIFEST_VERSION};
pub use raw::{RawManifest, RawStep};
pub use step::{RspFile, Step, StepIndex};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use std::path::PathBuf;

    fn step(command: &str, inputs: &[&str], outputs: &[&str]) -> RawStep {
        RawStep {
            command: Some(command.to_string()),
            inputs: inputs.iter().map(PathBuf::from).collect(),
            outputs: outputs.iter().map(PathBuf::from).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn simple_chain_compiles_with_one_root() {
        let raw = RawManifest {
            steps: vec![step("gen one", &[], &["one"]), step("gen two", &["one"], &["two"])],
            ..Default::default()
        };
        let compiled = CompiledManifest::compile(&raw).unwrap();
        assert_eq!(compiled.steps[1].dependencies, vec![StepIndex(0)]);
        assert_eq!(compiled.roots, vec![StepIndex(1)]);
    }

    #[test]
    fn duplicate_output_is_an_error() {
        let raw = RawManifest {
            steps: vec![step("a", &[], &["out"]), step("b", &[], &["out"])],
            ..Default::default()
        };
        let err = CompiledManifest::compile(&raw).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateOutput { .. }));
    }

    #[test]
    fn self_cycle_is_detected() {
        let raw = RawManifest {
            steps: vec![step("a", &["out"], &["out"])],
            ..Default::default()
        };
        let err = CompiledManifest::compile(&raw).unwrap_err();
        assert!(matches!(err, CompileError::Cycle { .. }));
    }

    #[test]
    fn two_cycle_is_detected() {
        let raw = RawManifest {
            steps: vec![step("a", &["b"], &["a"]), step("b", &["a"], &["b"])],
            ..Default::default()
        };
        let err = CompiledManifest::compile(&raw).unwrap_err();
        assert!(matches!(err, CompileError::Cycle { .. }));
    }

    #[test]
    fn generator_cannot_depend_on_ordinary() {
        let mut gen_step = step("regen", &["normal_out"], &["manifest"]);
        gen_step.generator = true;
        let raw = RawManifest {
            steps: vec![step("a", &[], &["normal_out"]), gen_step],
            ..Default::default()
        };
        let err = CompiledManifest::compile(&raw).unwrap_err();
        assert!(matches!(err, CompileError::GeneratorDependsOnOrdinary { .. }));
    }

    #[test]
    fn phony_is_transparent_to_generator_partition_check() {
        let mut gen_step = step("regen", &[], &["manifest"]);
        gen_step.generator = true;
        let mut gen_step2 = step("regen2", &["phony_alias"], &["manifest2"]);
        gen_step2.generator = true;
        let phony = RawStep {
            command: None,
            inputs: vec![PathBuf::from("manifest")],
            outputs: vec![PathBuf::from("phony_alias")],
            ..Default::default()
        };
        let raw = RawManifest {
            steps: vec![gen_step, phony, gen_step2],
            ..Default::default()
        };
        assert!(CompiledManifest::compile(&raw).is_ok());
    }

    #[test]
    fn serialize_load_round_trip_is_identity() {
        let raw = RawManifest {
            steps: vec![step("gen one", &[], &["one"]), step("gen two", &["one"], &["two"])],
            defaults: vec![PathBuf::from("two")],
            ..Default::default()
        };
        let compiled = CompiledManifest::compile(&raw).unwrap();
        let bytes = compiled.serialize();
        let loaded = CompiledManifest::load(&bytes).unwrap();
        assert_eq!(loaded.steps.len(), compiled.steps.len());
        assert_eq!(loaded.defaults, compiled.defaults);
        assert_eq!(loaded.roots, compiled.roots);
        for (a, b) in loaded.steps.iter().zip(compiled.steps.iter()) {
            assert_eq!(a.step_hash, b.step_hash);
            assert_eq!(a.declared_outputs, b.declared_outputs);
            assert_eq!(a.dependencies, b.dependencies);
        }
    }

    #[test]
    fn out_of_range_index_is_rejected_on_load() {
        let raw = RawManifest { steps: vec![step("a", &[], &["out"])], ..Default::default() };
        let compiled = CompiledManifest::compile(&raw).unwrap();
        let mut bytes = compiled.serialize();
        // Corrupt version to force a clean failure path exercise as well.
        bytes[0] = 0xff;
        assert!(CompiledManifest::load(&bytes).is_err());
    }
}
