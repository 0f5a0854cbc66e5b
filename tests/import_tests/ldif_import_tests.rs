//! Tests for LDIF import
//!
//! These tests verify:
//! - A fresh import fills every database and trusts every index
//! - Duplicate and orphan entries are rejected unless validation is off
//! - Append, replace, include and exclude rules
//! - Existing entries outside the include branches are migrated
//! - Disk exhaustion and cancellation abort the import

use std::sync::Arc;

use dirstore::import::{ImportListener, ImportPhase, ManualDiskMonitor};
use dirstore::{Config, DirError, ImportConfig, Importer, RootContainer, Schema};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::common::*;

fn import_config() -> dirstore::config::ImportConfigBuilder {
    ImportConfig::builder().thread_count(2)
}

#[derive(Default)]
struct RecordingListener {
    phases: Mutex<Vec<ImportPhase>>,
    rejected: Mutex<Vec<String>>,
}

impl ImportListener for RecordingListener {
    fn phase_started(&self, phase: ImportPhase) {
        self.phases.lock().push(phase);
    }

    fn entry_rejected(&self, dn: &str, _reason: &str) {
        self.rejected.lock().push(dn.to_string());
    }
}

// =============================================================================
// Fresh import
// =============================================================================

#[test]
fn test_import_ldif() {
    let (temp, root, container) = setup_temp_root();
    let ldif = write_ldif(temp.path(), "data.ldif", &directory_records(40));
    let listener = Arc::new(RecordingListener::default());

    let result = Importer::new(&root, import_config().build())
        .with_listener(listener.clone())
        .import_ldif(&ldif)
        .unwrap();

    assert_eq!(result.entries_read, 45);
    assert_eq!(result.entries_imported, 45);
    assert_eq!(result.entries_rejected, 0);
    assert_eq!(container.entry_count(), 45);
    assert_all_trusted(&container);
    assert_eq!(
        *listener.phases.lock(),
        vec![ImportPhase::Setup, ImportPhase::PhaseOne, ImportPhase::PhaseTwo, ImportPhase::Finished]
    );

    assert_eq!(count(&container, "(uid=user7)"), 1);
    assert_eq!(count(&container, "(sn=Surname3)"), 4);
    assert_eq!(count(&container, "(cn=*ser 1*)"), 11);
    assert_eq!(count(&container, "(sn>=Surname8)"), 8);
    assert_eq!(container.num_subordinates(&dn(PEOPLE), false).unwrap(), Some(40));
    assert_eq!(container.num_subordinates(&dn(BASE), true).unwrap(), Some(44));
    assert_eq!(container.vlv_index("bysn").unwrap().count(), 40);

    // Scratch space is gone
    assert!(!temp.path().join("import-tmp").exists());
}

#[test]
fn test_import_replaces_previous_content() {
    let (temp, root, container) = setup_temp_root();
    let first = write_ldif(temp.path(), "first.ldif", &directory_records(10));
    Importer::new(&root, import_config().build()).import_ldif(&first).unwrap();

    let second = write_ldif(temp.path(), "second.ldif", &directory_records(3));
    Importer::new(&root, import_config().build()).import_ldif(&second).unwrap();

    assert_eq!(container.entry_count(), 8);
    assert_eq!(count(&container, "(uid=user9)"), 0);
    assert_eq!(container.vlv_index("bysn").unwrap().count(), 3);
}

#[test]
fn test_ids_resume_after_import() {
    let (temp, root, container) = setup_temp_root();
    let ldif = write_ldif(temp.path(), "data.ldif", &directory_records(5));
    Importer::new(&root, import_config().build()).import_ldif(&ldif).unwrap();

    let highest = container.id2entry().highest_id().unwrap().unwrap();
    let entry = dirstore::Entry::new(dn(&format!("uid=late,{}", PEOPLE))).with("objectClass", &["person"]);
    assert!(container.add_entry(&entry).unwrap() > highest);
}

#[test]
fn test_import_multiple_base_dns() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path())
        .base_dns(vec![dn(BASE), dn("dc=example,dc=org")])
        .build();
    let root = RootContainer::open(config, Schema::default_schema()).unwrap();
    let mut records = base_records();
    records.push("dn: dc=example,dc=org\nobjectClass: domain\ndc: example\n".to_string());
    records.push("dn: ou=sales,dc=example,dc=org\nobjectClass: organizationalUnit\nou: sales\n".to_string());
    records.push("dn: dc=elsewhere,dc=net\nobjectClass: domain\n".to_string());
    let ldif = write_ldif(temp.path(), "data.ldif", &records);

    let result = Importer::new(&root, import_config().build()).import_ldif(&ldif).unwrap();
    assert_eq!(result.entries_imported, 5);
    assert_eq!(result.entries_ignored, 1);
    assert_eq!(root.container(&dn(BASE)).unwrap().entry_count(), 3);
    assert_eq!(root.container(&dn("dc=example,dc=org")).unwrap().entry_count(), 2);
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_rejects_duplicates_and_orphans() {
    let (temp, root, container) = setup_temp_root();
    let mut records = directory_records(3);
    records.push(person_record(1));
    records.push("dn: uid=x,ou=nowhere,dc=example,dc=com\nobjectClass: person\nuid: x\n".to_string());
    records.push("dn: uid=y,ou=people,dc=example,dc=com\nchangetype: delete\n".to_string());
    let ldif = write_ldif(temp.path(), "data.ldif", &records);
    let listener = Arc::new(RecordingListener::default());

    let result = Importer::new(&root, import_config().build())
        .with_listener(listener.clone())
        .import_ldif(&ldif)
        .unwrap();

    assert_eq!(result.entries_imported, 8);
    assert_eq!(result.entries_rejected, 3);
    assert_eq!(container.entry_count(), 8);
    let rejected = listener.rejected.lock();
    assert!(rejected.iter().any(|d| d.contains("uid=user1")));
    assert!(rejected.iter().any(|d| d.contains("ou=nowhere")));
}

#[test]
fn test_skip_dn_validation_accepts_orphans() {
    let (temp, root, container) = setup_temp_root();
    let mut records = base_records();
    records.push("dn: uid=x,ou=nowhere,dc=example,dc=com\nobjectClass: person\nuid: x\n".to_string());
    let ldif = write_ldif(temp.path(), "data.ldif", &records);

    let result = Importer::new(&root, import_config().skip_dn_validation(true).build())
        .import_ldif(&ldif)
        .unwrap();
    assert_eq!(result.entries_imported, 4);
    assert!(container.get_entry(&dn("uid=x,ou=nowhere,dc=example,dc=com")).unwrap().is_some());
}

// =============================================================================
// Append and branches
// =============================================================================

#[test]
fn test_append_keeps_existing_entries() {
    let (temp, root, container) = setup_temp_root();
    let first = write_ldif(temp.path(), "first.ldif", &directory_records(5));
    Importer::new(&root, import_config().build()).import_ldif(&first).unwrap();

    let more = write_ldif(temp.path(), "more.ldif", &[person_record(3), person_record(10), person_record(11)]);
    let result = Importer::new(&root, import_config().append(true).build())
        .import_ldif(&more)
        .unwrap();

    assert_eq!(result.entries_imported, 2);
    assert_eq!(result.entries_rejected, 1);
    assert_eq!(container.entry_count(), 12);
    assert_eq!(count(&container, "(uid=user11)"), 1);
    assert_eq!(container.num_subordinates(&dn(PEOPLE), false).unwrap(), Some(7));
    assert_all_trusted(&container);
}

#[test]
fn test_append_replace_existing() {
    let (temp, root, container) = setup_temp_root();
    let first = write_ldif(temp.path(), "first.ldif", &directory_records(5));
    Importer::new(&root, import_config().build()).import_ldif(&first).unwrap();
    let old_id = container.entry_id_for_dn(&dn(&format!("uid=user2,{}", PEOPLE))).unwrap();

    let replacement = format!(
        "dn: uid=user2,{PEOPLE}\nobjectClass: top\nobjectClass: person\nuid: user2\ncn: Renamed Person\nsn: Other\n"
    );
    let ldif = write_ldif(temp.path(), "replace.ldif", &[replacement]);
    let result = Importer::new(&root, import_config().append(true).replace_existing(true).build())
        .import_ldif(&ldif)
        .unwrap();

    assert_eq!(result.entries_imported, 1);
    assert_eq!(container.entry_count(), 10);
    assert_eq!(container.entry_id_for_dn(&dn(&format!("uid=user2,{}", PEOPLE))).unwrap(), old_id);
    assert_eq!(count(&container, "(cn=Renamed Person)"), 1);
    assert_eq!(count(&container, "(cn=User 2)"), 0);
    assert_eq!(count(&container, "(sn=Surname2)"), 0);
    assert_eq!(container.vlv_index("bysn").unwrap().count(), 5);
}

#[test]
fn test_exclude_branch_skips_entries() {
    let (temp, root, container) = setup_temp_root();
    let ldif = write_ldif(temp.path(), "data.ldif", &directory_records(4));

    let result = Importer::new(&root, import_config().exclude_branch(dn(GROUPS)).build())
        .import_ldif(&ldif)
        .unwrap();
    assert_eq!(result.entries_ignored, 3);
    assert_eq!(container.entry_count(), 6);
    assert!(container.get_entry(&dn(GROUPS)).unwrap().is_none());
}

#[test]
fn test_include_branch_migrates_the_rest() {
    let (temp, root, container) = setup_temp_root();
    let first = write_ldif(temp.path(), "first.ldif", &directory_records(6));
    Importer::new(&root, import_config().build()).import_ldif(&first).unwrap();

    // Reload only the people branch
    let mut people = vec![base_records()[1].clone()];
    people.extend((100..103).map(person_record));
    let ldif = write_ldif(temp.path(), "people.ldif", &people);
    let result = Importer::new(&root, import_config().include_branch(dn(PEOPLE)).build())
        .import_ldif(&ldif)
        .unwrap();

    assert_eq!(result.entries_imported, 4);
    // Base entry, ou=groups and its two groups
    assert_eq!(result.entries_migrated, 4);
    assert_eq!(container.entry_count(), 8);
    assert_eq!(count(&container, "(uid=user1)"), 0);
    assert_eq!(count(&container, "(uid=user101)"), 1);
    assert_eq!(count(&container, "(cn=admins)"), 1);
    assert_all_trusted(&container);
}

#[test]
fn test_clear_backend_with_branches_drops_everything() {
    let (temp, root, container) = setup_temp_root();
    let first = write_ldif(temp.path(), "first.ldif", &directory_records(6));
    Importer::new(&root, import_config().build()).import_ldif(&first).unwrap();

    let ldif = write_ldif(temp.path(), "base.ldif", &base_records());
    let result = Importer::new(&root, import_config().exclude_branch(dn(GROUPS)).clear_backend(true).build())
        .import_ldif(&ldif)
        .unwrap();
    assert_eq!(result.entries_migrated, 0);
    assert_eq!(container.entry_count(), 2);
}

// =============================================================================
// Failures
// =============================================================================

struct FillDiskOnPhaseTwo {
    monitor: Arc<ManualDiskMonitor>,
}

impl ImportListener for FillDiskOnPhaseTwo {
    fn phase_started(&self, phase: ImportPhase) {
        if phase == ImportPhase::PhaseTwo {
            self.monitor.report_all(0);
        }
    }
}

#[test]
fn test_disk_full_aborts_with_phase() {
    let (temp, root, container) = setup_temp_root();
    let ldif = write_ldif(temp.path(), "data.ldif", &directory_records(10));
    let monitor = Arc::new(ManualDiskMonitor::new(1 << 20, 1 << 10));

    let err = Importer::new(&root, import_config().build())
        .with_disk_monitor(monitor.clone())
        .with_listener(Arc::new(FillDiskOnPhaseTwo { monitor: monitor.clone() }))
        .import_ldif(&ldif)
        .unwrap_err();

    match err {
        DirError::DiskSpace { phase, .. } => assert_eq!(phase, "phase two"),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(monitor.registered().is_empty());
    assert!(!container.attribute_index("uid").unwrap().index("equality").unwrap().is_trusted());
}

#[test]
fn test_canceled_before_start() {
    let (temp, root, container) = setup_temp_root();
    let ldif = write_ldif(temp.path(), "data.ldif", &directory_records(3));

    let importer = Importer::new(&root, import_config().build());
    importer.cancellation_token().cancel();
    assert!(matches!(importer.import_ldif(&ldif), Err(DirError::Canceled)));
    assert!(!container.id2children().is_trusted());
}

#[test]
fn test_missing_ldif_file() {
    let (temp, root, _container) = setup_temp_root();
    let result = Importer::new(&root, import_config().build()).import_ldif(&temp.path().join("absent.ldif"));
    assert!(matches!(result, Err(DirError::Io(_))));
}
