use std::fs;

use serde_json::json;
use substep::error::StepError;
use substep::resolve::{expand_input_files, ArgValue};
use substep::target::{zapped_path, ExistMode, Target, TargetSet};

mod helpers;
use helpers::{file_names, touch, workspace, EnvVarGuard};

fn raw(s: &str) -> ArgValue {
    ArgValue::Value(json!(s))
}

#[test]
fn glob_patterns_expand_to_sorted_matches() {
    let dir = workspace();
    touch(dir.path(), &["b.txt", "a.txt", "c.log"]);
    let pattern = dir.path().join("*.txt");

    let set = expand_input_files(&[raw(&pattern.to_string_lossy())], false).unwrap();
    assert!(set.is_valid());
    assert_eq!(file_names(&set), vec!["a.txt", "b.txt"]);
}

#[test]
fn existing_paths_keep_declaration_order_and_dedupe() {
    let dir = workspace();
    let files = touch(dir.path(), &["z.txt", "y.txt"]);
    let items = vec![
        raw(&files[0].to_string_lossy()),
        raw(&files[1].to_string_lossy()),
        raw(&files[0].to_string_lossy()),
    ];
    let set = expand_input_files(&items, false).unwrap();
    assert_eq!(file_names(&set), vec!["z.txt", "y.txt"]);
}

#[test]
fn zapped_files_count_as_present() {
    let dir = workspace();
    let path = dir.path().join("big.bam");
    fs::write(zapped_path(&path), "0123abcd\n").unwrap();

    let set = expand_input_files(&[raw(&path.to_string_lossy())], false).unwrap();
    assert_eq!(set.len(), 1);
    let target = &set.targets()[0];
    assert!(!target.exists(ExistMode::Target));
    assert!(target.exists(ExistMode::Any));
    assert_eq!(target.fingerprint().unwrap(), "0123abcd");
}

#[test]
fn missing_files_are_unknown_and_retryable() {
    let dir = workspace();
    let missing = dir.path().join("nope.txt");
    let err = expand_input_files(&[raw(&missing.to_string_lossy())], false).unwrap_err();
    assert!(matches!(err, StepError::UnknownTarget(_)), "{err}");
    assert!(err.is_retryable());

    let empty_glob = dir.path().join("*.none");
    let err = expand_input_files(&[raw(&empty_glob.to_string_lossy())], false).unwrap_err();
    assert!(matches!(err, StepError::UnknownTarget(ref p) if p.ends_with("*.none")), "{err}");
}

#[test]
fn declared_outputs_need_not_exist() {
    let dir = workspace();
    let pattern = dir.path().join("out_*.txt");
    let set = expand_input_files(&[raw(&pattern.to_string_lossy())], true).unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.targets()[0], Target::File(pattern));
}

#[test]
fn abstract_targets_use_their_own_existence_check() {
    let name = "SUBSTEP_RESOLVE_TEST_VAR";
    let probe = ArgValue::Target(Target::EnvVar(name.to_string()));
    {
        let _unset = EnvVarGuard::unset(name);
        let err = expand_input_files(std::slice::from_ref(&probe), false).unwrap_err();
        assert!(matches!(err, StepError::UnknownTarget(_)), "{err}");
        assert_eq!(expand_input_files(std::slice::from_ref(&probe), true).unwrap().len(), 1);
    }
    let _set = EnvVarGuard::set(name, "1");
    let set = expand_input_files(&[probe], false).unwrap();
    assert_eq!(set.joined(), format!("env_var({name})"));
}

#[test]
fn dynamic_outputs_resolve_after_the_fact() {
    let dir = workspace();
    let pattern = dir.path().join("part_*.csv").to_string_lossy().into_owned();
    let declared = expand_input_files(
        &[ArgValue::Target(Target::Dynamic(pattern.clone()))],
        true,
    )
    .unwrap();
    assert!(declared.is_undetermined());

    touch(dir.path(), &["part_2.csv", "part_1.csv"]);
    let resolved = declared.resolve_dynamic().unwrap();
    assert!(resolved.is_valid());
    assert_eq!(file_names(&resolved), vec!["part_1.csv", "part_2.csv"]);
}

#[test]
fn target_sets_flatten_into_the_result() {
    let dir = workspace();
    let files = touch(dir.path(), &["one.txt", "two.txt"]);
    let set = expand_input_files(
        &[ArgValue::Targets(TargetSet::from_paths(files.clone()))],
        false,
    )
    .unwrap();
    assert_eq!(set.paths(), files.iter().map(|p| p.as_path()).collect::<Vec<_>>());
}

#[test]
fn non_path_values_name_their_type() {
    let err = expand_input_files(&[ArgValue::Value(json!({"a": 1}))], false).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("object"), "{msg}");
}
