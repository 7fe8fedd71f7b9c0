use super::schema::{clean_email, normalize_key, parse_boolish, ImportRow, PersonRow, RowRecord};
use super::settings::ImportSettings;
use super::snapshot::{Snapshot, UserRecord};
use super::validator::{match_account, AccountMatch};
use super::{ImportKind, ImportPolicy};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseSpec {
    pub name_de: String,
    pub name_en: String,
    pub kind: String,
    pub is_graded: bool,
    pub program: String,
    pub responsible_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanOp {
    CreateUser {
        person: PersonRow,
        username: Option<String>,
    },
    UpdateUser {
        user_id: String,
        person: PersonRow,
        reactivate: bool,
    },
    UpdateAccount {
        user_id: String,
        email_from: String,
        email: String,
        username: String,
        reactivate: bool,
    },
    DeactivateUser {
        user_id: String,
        email: String,
    },
    DeleteUser {
        user_id: String,
        email: String,
    },
    AddParticipant {
        email: String,
    },
    RemoveParticipant {
        user_id: String,
        email: String,
    },
    AddContributor {
        email: String,
    },
    RemoveContributor {
        user_id: String,
        email: String,
    },
    CreateProgram {
        name: String,
    },
    CreateCourseKind {
        name: String,
    },
    CreateCourse {
        course: CourseSpec,
    },
    UpdateCourse {
        course_id: String,
        course: CourseSpec,
    },
    DeleteCourse {
        course_id: String,
        name_en: String,
    },
    CreateEvaluation {
        course_name_en: String,
    },
    Enroll {
        course_name_en: String,
        email: String,
    },
}

impl PlanOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateUser { .. } => "create_user",
            Self::UpdateUser { .. } => "update_user",
            Self::UpdateAccount { .. } => "update_account",
            Self::DeactivateUser { .. } => "deactivate_user",
            Self::DeleteUser { .. } => "delete_user",
            Self::AddParticipant { .. } => "add_participant",
            Self::RemoveParticipant { .. } => "remove_participant",
            Self::AddContributor { .. } => "add_contributor",
            Self::RemoveContributor { .. } => "remove_contributor",
            Self::CreateProgram { .. } => "create_program",
            Self::CreateCourseKind { .. } => "create_course_kind",
            Self::CreateCourse { .. } => "create_course",
            Self::UpdateCourse { .. } => "update_course",
            Self::DeleteCourse { .. } => "delete_course",
            Self::CreateEvaluation { .. } => "create_evaluation",
            Self::Enroll { .. } => "enroll",
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Self::CreateUser { .. }
            | Self::AddParticipant { .. }
            | Self::AddContributor { .. }
            | Self::CreateProgram { .. }
            | Self::CreateCourseKind { .. }
            | Self::CreateCourse { .. }
            | Self::CreateEvaluation { .. }
            | Self::Enroll { .. } => Effect::Created,
            Self::UpdateUser { .. }
            | Self::UpdateAccount { .. }
            | Self::DeactivateUser { .. }
            | Self::UpdateCourse { .. } => Effect::Updated,
            Self::DeleteUser { .. }
            | Self::RemoveParticipant { .. }
            | Self::RemoveContributor { .. }
            | Self::DeleteCourse { .. } => Effect::Deleted,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPlan {
    pub kind: ImportKind,
    pub target_id: Option<String>,
    pub policy: ImportPolicy,
    pub ops: Vec<PlanOp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Operation name -> count.
    pub breakdown: BTreeMap<String, usize>,
}

impl ImportPlan {
    pub fn counts(&self) -> PlanCounts {
        let mut out = PlanCounts::default();
        for op in &self.ops {
            match op.effect() {
                Effect::Created => out.created += 1,
                Effect::Updated => out.updated += 1,
                Effect::Deleted => out.deleted += 1,
            }
            *out.breakdown.entry(op.name().to_string()).or_insert(0) += 1;
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Under replace, every deletion precedes every creation or update.
pub fn plan(
    kind: ImportKind,
    rows: &[ImportRow],
    snapshot: &Snapshot,
    policy: ImportPolicy,
    settings: &ImportSettings,
) -> ImportPlan {
    let ops = match kind {
        ImportKind::User => plan_users(rows, snapshot, policy),
        ImportKind::Participant | ImportKind::Contributor => {
            plan_members(kind, rows, snapshot, policy)
        }
        ImportKind::Semester => plan_semester(rows, snapshot, policy),
        ImportKind::UserBulkUpdate => plan_accounts(rows, snapshot, policy, settings),
    };
    ImportPlan {
        kind,
        target_id: snapshot.target_id.clone(),
        policy,
        ops,
    }
}

/// Unique persons in first-appearance order; a later row replaces the data
/// of an earlier one, keeping a known title when the later row has none.
fn unique_persons<'a>(persons: impl Iterator<Item = &'a PersonRow>) -> Vec<PersonRow> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<PersonRow> = Vec::new();
    for p in persons {
        let email = clean_email(&p.email);
        if email.is_empty() {
            continue;
        }
        let mut next = p.clone();
        next.email = email.clone();
        match index.get(&email) {
            Some(&i) => {
                if next.title.is_empty() {
                    next.title = std::mem::take(&mut out[i].title);
                }
                out[i] = next;
            }
            None => {
                index.insert(email, out.len());
                out.push(next);
            }
        }
    }
    out
}

fn person_records(rows: &[ImportRow]) -> impl Iterator<Item = &PersonRow> {
    rows.iter().filter_map(|r| match &r.record {
        RowRecord::Person(p) => Some(p),
        _ => None,
    })
}

fn upsert_user(ops: &mut Vec<PlanOp>, person: &PersonRow, existing: Option<&UserRecord>, always: bool) {
    match existing {
        Some(user) => {
            if always || user.differs_from(person) || !user.is_active {
                ops.push(PlanOp::UpdateUser {
                    user_id: user.id.clone(),
                    person: person.clone(),
                    reactivate: !user.is_active,
                });
            }
        }
        None => ops.push(PlanOp::CreateUser {
            person: person.clone(),
            username: None,
        }),
    }
}

fn plan_users(rows: &[ImportRow], snapshot: &Snapshot, policy: ImportPolicy) -> Vec<PlanOp> {
    let persons = unique_persons(person_records(rows));
    let mut ops = Vec::new();
    if policy == ImportPolicy::Replace {
        let keep: HashSet<&str> = persons.iter().map(|p| p.email.as_str()).collect();
        for user in &snapshot.users {
            if !keep.contains(clean_email(&user.email).as_str()) {
                ops.push(PlanOp::DeleteUser {
                    user_id: user.id.clone(),
                    email: user.email.clone(),
                });
            }
        }
    }
    for person in &persons {
        upsert_user(&mut ops, person, snapshot.user_by_email(&person.email), true);
    }
    ops
}

fn plan_members(
    kind: ImportKind,
    rows: &[ImportRow],
    snapshot: &Snapshot,
    policy: ImportPolicy,
) -> Vec<PlanOp> {
    let persons = unique_persons(person_records(rows));
    let mut ops = Vec::new();
    if policy == ImportPolicy::Replace {
        let keep: HashSet<&str> = persons
            .iter()
            .filter_map(|p| snapshot.user_by_email(&p.email))
            .map(|u| u.id.as_str())
            .collect();
        for member_id in &snapshot.member_ids {
            if keep.contains(member_id.as_str()) {
                continue;
            }
            let email = snapshot
                .user(member_id)
                .map(|u| u.email.clone())
                .unwrap_or_default();
            let user_id = member_id.clone();
            ops.push(if kind == ImportKind::Contributor {
                PlanOp::RemoveContributor { user_id, email }
            } else {
                PlanOp::RemoveParticipant { user_id, email }
            });
        }
    }
    for person in &persons {
        let existing = snapshot.user_by_email(&person.email);
        upsert_user(&mut ops, person, existing, false);
        if existing.is_some_and(|u| snapshot.is_member(&u.id)) {
            continue;
        }
        let email = person.email.clone();
        ops.push(if kind == ImportKind::Contributor {
            PlanOp::AddContributor { email }
        } else {
            PlanOp::AddParticipant { email }
        });
    }
    ops
}

fn plan_semester(rows: &[ImportRow], snapshot: &Snapshot, policy: ImportPolicy) -> Vec<PlanOp> {
    let enrollments = rows
        .iter()
        .filter_map(|r| match &r.record {
            RowRecord::Enrollment(e) => Some(e),
            _ => None,
        })
        .collect::<Vec<_>>();

    let mut deletions = Vec::new();
    let mut ops = Vec::new();

    let mut seen_programs = HashSet::new();
    let mut seen_kinds = HashSet::new();
    for e in &enrollments {
        if snapshot.program_by_name(&e.program).is_none()
            && seen_programs.insert(normalize_key(&e.program))
        {
            ops.push(PlanOp::CreateProgram {
                name: e.program.clone(),
            });
        }
        if snapshot.course_kind_by_name(&e.course_kind).is_none()
            && seen_kinds.insert(normalize_key(&e.course_kind))
        {
            ops.push(PlanOp::CreateCourseKind {
                name: e.course_kind.clone(),
            });
        }
    }

    let persons = unique_persons(
        enrollments
            .iter()
            .flat_map(|e| [&e.responsible, &e.participant]),
    );
    for person in &persons {
        upsert_user(&mut ops, person, snapshot.user_by_email(&person.email), false);
    }

    let mut course_keys: Vec<String> = Vec::new();
    let mut seen_courses = HashSet::new();
    for e in &enrollments {
        let key = normalize_key(&e.course_name_en);
        if !seen_courses.insert(key.clone()) {
            continue;
        }
        course_keys.push(key);
        let wanted = CourseSpec {
            name_de: e.course_name_de.clone(),
            name_en: e.course_name_en.clone(),
            kind: e.course_kind.clone(),
            is_graded: parse_boolish(&e.course_is_graded).unwrap_or(true),
            program: e.program.clone(),
            responsible_email: clean_email(&e.responsible.email),
        };
        match snapshot.course_by_name_en(&e.course_name_en) {
            Some(existing) => {
                let kind_same = snapshot
                    .course_kind_by_name(&wanted.kind)
                    .is_some_and(|k| k.id == existing.kind_id);
                let program_listed = snapshot
                    .program_by_name(&wanted.program)
                    .is_some_and(|p| existing.program_ids.contains(&p.id));
                let responsible_listed = snapshot
                    .user_by_email(&wanted.responsible_email)
                    .is_some_and(|u| existing.responsible_ids.contains(&u.id));
                let changed = normalize_key(&existing.name_de) != normalize_key(&wanted.name_de)
                    || !kind_same
                    || existing.is_graded != wanted.is_graded
                    || !program_listed
                    || !responsible_listed;
                let needs_evaluation = existing.evaluation_id.is_none();
                if changed {
                    ops.push(PlanOp::UpdateCourse {
                        course_id: existing.id.clone(),
                        course: wanted,
                    });
                }
                if needs_evaluation {
                    ops.push(PlanOp::CreateEvaluation {
                        course_name_en: existing.name_en.clone(),
                    });
                }
            }
            None => ops.push(PlanOp::CreateCourse { course: wanted }),
        }
    }

    let mut seen_enrollments = HashSet::new();
    for e in &enrollments {
        let email = clean_email(&e.participant.email);
        let key = (email.clone(), normalize_key(&e.course_name_en));
        if !seen_enrollments.insert(key) {
            continue;
        }
        let already = match (
            snapshot.course_by_name_en(&e.course_name_en),
            snapshot.user_by_email(&email),
        ) {
            (Some(course), Some(user)) => course.participant_ids.contains(&user.id),
            _ => false,
        };
        if !already {
            ops.push(PlanOp::Enroll {
                course_name_en: e.course_name_en.clone(),
                email,
            });
        }
    }

    if policy == ImportPolicy::Replace {
        for course in &snapshot.courses {
            if !course_keys.contains(&normalize_key(&course.name_en)) {
                deletions.push(PlanOp::DeleteCourse {
                    course_id: course.id.clone(),
                    name_en: course.name_en.clone(),
                });
            }
        }
    }
    deletions.extend(ops);
    deletions
}

fn plan_accounts(
    rows: &[ImportRow],
    snapshot: &Snapshot,
    policy: ImportPolicy,
    settings: &ImportSettings,
) -> Vec<PlanOp> {
    let mut ops = Vec::new();
    let mut matched: HashSet<&str> = HashSet::new();
    let mut seen_emails = HashSet::new();

    for row in rows {
        let RowRecord::Account(account) = &row.record else {
            continue;
        };
        let email = clean_email(&account.email);
        if account.username.is_empty()
            || !settings.is_internal_email(&email)
            || !seen_emails.insert(email.clone())
        {
            continue;
        }
        let user = match match_account(snapshot, settings, &email) {
            AccountMatch::Exact(u) | AccountMatch::LocalPart(u) => u,
            AccountMatch::Ambiguous(_) => continue,
            AccountMatch::Unmatched => {
                ops.push(PlanOp::CreateUser {
                    person: PersonRow {
                        email,
                        ..PersonRow::default()
                    },
                    username: Some(account.username.clone()),
                });
                continue;
            }
        };
        matched.insert(user.id.as_str());
        let changed = clean_email(&user.email) != email
            || user.username.as_deref() != Some(account.username.as_str())
            || !user.is_active;
        if changed {
            ops.push(PlanOp::UpdateAccount {
                user_id: user.id.clone(),
                email_from: user.email.clone(),
                email,
                username: account.username.clone(),
                reactivate: !user.is_active,
            });
        }
    }

    if policy == ImportPolicy::Merge {
        return ops;
    }
    let mut deletions = Vec::new();
    for user in &snapshot.users {
        if matched.contains(user.id.as_str()) {
            continue;
        }
        if !user.is_referenced() {
            deletions.push(PlanOp::DeleteUser {
                user_id: user.id.clone(),
                email: user.email.clone(),
            });
        } else if user.is_active {
            deletions.push(PlanOp::DeactivateUser {
                user_id: user.id.clone(),
                email: user.email.clone(),
            });
        }
    }
    // Deactivations are updates, but they still belong with the removals.
    deletions.extend(ops);
    deletions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::snapshot::CourseRecord;
    use crate::import::validator::tests::{account_row, enrollment_row, person_row, snapshot, user};

    fn names(plan: &ImportPlan) -> Vec<&'static str> {
        plan.ops.iter().map(PlanOp::name).collect()
    }

    #[test]
    fn merge_updates_matches_and_creates_new_users() {
        let snap = snapshot(ImportKind::User, vec![user("u1", "jane@x.edu", "Jane", "Doe")], &[]);
        let rows = vec![
            person_row(2, "Dr.", "Jane", "Doe", "jane@x.edu"),
            person_row(3, "", "Max", "Muster", "max@x.edu"),
        ];
        let plan = plan(ImportKind::User, &rows, &snap, ImportPolicy::Merge, &ImportSettings::default());
        assert_eq!(names(&plan), vec!["update_user", "create_user"]);
        let counts = plan.counts();
        assert_eq!((counts.created, counts.updated, counts.deleted), (1, 1, 0));
    }

    #[test]
    fn replace_deletes_absent_users_first() {
        let snap = snapshot(
            ImportKind::User,
            vec![
                user("u1", "jane@x.edu", "Jane", "Doe"),
                user("u2", "old@x.edu", "Old", "User"),
            ],
            &[],
        );
        let rows = vec![
            person_row(2, "", "Max", "Muster", "max@x.edu"),
            person_row(3, "", "Jane", "Doe", "Jane@X.edu"),
        ];
        let plan = plan(ImportKind::User, &rows, &snap, ImportPolicy::Replace, &ImportSettings::default());
        assert_eq!(names(&plan), vec!["delete_user", "create_user", "update_user"]);
        assert!(matches!(&plan.ops[0], PlanOp::DeleteUser { user_id, .. } if user_id == "u2"));
    }

    #[test]
    fn last_duplicate_row_wins() {
        let snap = snapshot(ImportKind::User, Vec::new(), &[]);
        let rows = vec![
            person_row(2, "Dr.", "Jane", "Doe", "jane@x.edu"),
            person_row(3, "", "Jane", "Doe", "jane@x.edu"),
        ];
        let plan = plan(ImportKind::User, &rows, &snap, ImportPolicy::Merge, &ImportSettings::default());
        assert_eq!(plan.ops.len(), 1);
        match &plan.ops[0] {
            PlanOp::CreateUser { person, .. } => assert_eq!(person.title, "Dr."),
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn membership_replace_detaches_but_never_deletes_users() {
        let snap = snapshot(
            ImportKind::Participant,
            vec![
                user("u1", "jane@x.edu", "Jane", "Doe"),
                user("u2", "gone@x.edu", "Gone", "Student"),
            ],
            &["u1", "u2"],
        );
        let rows = vec![
            person_row(2, "", "Jane", "Doe", "jane@x.edu"),
            person_row(3, "", "New", "Student", "new@x.edu"),
        ];
        let merge = plan(ImportKind::Participant, &rows, &snap, ImportPolicy::Merge, &ImportSettings::default());
        assert_eq!(names(&merge), vec!["create_user", "add_participant"]);

        let replace = plan(ImportKind::Participant, &rows, &snap, ImportPolicy::Replace, &ImportSettings::default());
        assert_eq!(
            names(&replace),
            vec!["remove_participant", "create_user", "add_participant"]
        );
        assert_eq!(replace.counts().deleted, 1);
    }

    #[test]
    fn semester_plan_creates_catalog_then_courses_then_enrollments() {
        let snap = Snapshot::new(
            ImportKind::Semester,
            Some("s1".to_string()),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            vec![CourseRecord {
                id: "c-old".to_string(),
                name_de: "Alt".to_string(),
                name_en: "Old".to_string(),
                kind_id: "k".to_string(),
                is_graded: true,
                program_ids: Vec::new(),
                responsible_ids: Vec::new(),
                evaluation_id: None,
                participant_ids: Vec::new(),
            }],
        );
        let rows = vec![
            enrollment_row(2, "a@uni.edu", "Algorithms", "Algorithmen", "prof@uni.edu"),
            enrollment_row(3, "b@uni.edu", "Algorithms", "Algorithmen", "prof@uni.edu"),
            enrollment_row(4, "a@uni.edu", "Algorithms", "Algorithmen", "prof@uni.edu"),
        ];
        let plan = plan(ImportKind::Semester, &rows, &snap, ImportPolicy::Replace, &ImportSettings::default());
        assert_eq!(
            names(&plan),
            vec![
                "delete_course",
                "create_program",
                "create_course_kind",
                "create_user",
                "create_user",
                "create_user",
                "create_course",
                "enroll",
                "enroll",
            ]
        );
        match &plan.ops[6] {
            PlanOp::CreateCourse { course } => {
                assert!(course.is_graded);
                assert_eq!(course.responsible_email, "prof@uni.edu");
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn bulk_update_renames_creates_and_retires() {
        let settings = ImportSettings {
            internal_domains: vec!["uni.edu".to_string(), "inst.uni.edu".to_string()],
            ..ImportSettings::default()
        };
        let mut referenced = user("u3", "busy@uni.edu", "Busy", "Person");
        referenced.participations = 2;
        let snap = snapshot(
            ImportKind::UserBulkUpdate,
            vec![
                user("u1", "jane@inst.uni.edu", "Jane", "Doe"),
                user("u2", "idle@uni.edu", "Idle", "Person"),
                referenced,
                user("u4", "guest@gmail.com", "Ext", "Ern"),
            ],
            &[],
        );
        let rows = vec![
            account_row(1, "jdoe", "jane@uni.edu"),
            account_row(2, "newbie", "newbie@uni.edu"),
        ];
        let plan = plan(
            ImportKind::UserBulkUpdate,
            &rows,
            &snap,
            ImportPolicy::Replace,
            &settings,
        );
        assert_eq!(
            names(&plan),
            vec![
                "delete_user",
                "deactivate_user",
                "delete_user",
                "update_account",
                "create_user"
            ]
        );
        // Users outside the internal domains are retired like everyone else.
        assert!(matches!(
            &plan.ops[2],
            PlanOp::DeleteUser { email, .. } if email == "guest@gmail.com"
        ));
        match &plan.ops[3] {
            PlanOp::UpdateAccount {
                email_from, email, ..
            } => {
                assert_eq!(email_from, "jane@inst.uni.edu");
                assert_eq!(email, "jane@uni.edu");
            }
            other => panic!("unexpected op {other:?}"),
        }
    }
}
