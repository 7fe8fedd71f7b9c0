use super::diagnostics::{Category, ImporterLog};
use super::reader::Table;
use super::schema::{
    clean_email, is_valid_email, normalize_key, parse_boolish, AccountRow, EnrollmentRow,
    ImportRow, PersonRow, RowRecord,
};
use super::settings::ImportSettings;
use super::snapshot::{Snapshot, UserRecord};
use super::ImportKind;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Serialize)]
pub struct Validation {
    pub log: ImporterLog,
    /// True when the log holds no error entry.
    pub validated: bool,
}

/// Validates a decoded table, prefixed with notes about its columns.
pub fn validate_table(
    kind: ImportKind,
    table: &Table,
    snapshot: &Snapshot,
    settings: &ImportSettings,
) -> Validation {
    let mut log = column_notes(table);
    let rows = validate_rows(kind, &table.rows, snapshot, settings);
    log.extend(rows.log);
    let validated = !log.has_errors();
    Validation { log, validated }
}

pub fn column_notes(table: &Table) -> ImporterLog {
    let mut log = ImporterLog::new();
    for header in &table.missing_optional {
        log.info(
            Category::Schema,
            None,
            format!("optional column \"{}\" is missing; its values are left empty", header),
        );
    }
    for header in &table.ignored_columns {
        log.info(
            Category::Ignored,
            None,
            format!("column \"{}\" is not recognised and was ignored", header),
        );
    }
    log
}

pub fn validate_rows(
    kind: ImportKind,
    rows: &[ImportRow],
    snapshot: &Snapshot,
    settings: &ImportSettings,
) -> Validation {
    let mut log = ImporterLog::new();
    if rows.is_empty() {
        log.error(Category::General, None, "the file contains no data rows");
    } else {
        match kind {
            ImportKind::User | ImportKind::Participant | ImportKind::Contributor => {
                validate_persons(kind, rows, snapshot, &mut log)
            }
            ImportKind::Semester => validate_enrollments(rows, snapshot, &mut log),
            ImportKind::UserBulkUpdate => validate_accounts(rows, snapshot, settings, &mut log),
        }
    }
    let validated = !log.has_errors();
    Validation { log, validated }
}

/// Required-field and email checks shared by every person-shaped record.
/// Returns false when the person cannot be used further.
fn check_person(log: &mut ImporterLog, line: usize, role: &str, p: &PersonRow) -> bool {
    let mut ok = true;
    for (value, label) in [
        (&p.first_name, "first name"),
        (&p.last_name, "last name"),
        (&p.email, "email"),
    ] {
        if value.is_empty() {
            log.error(
                Category::MissingValue,
                Some(line),
                format!("{}{} is missing", role, label),
            );
            ok = false;
        }
    }
    if !p.email.is_empty() && !is_valid_email(&p.email) {
        log.error(
            Category::InvalidValue,
            Some(line),
            format!("{}email \"{}\" is not a valid address", role, p.email),
        );
        ok = false;
    }
    ok
}

fn names_conflict(a: &PersonRow, b: &PersonRow) -> bool {
    a.first_name != b.first_name
        || a.last_name != b.last_name
        || (!a.title.is_empty() && !b.title.is_empty() && a.title != b.title)
}

fn check_existing(log: &mut ImporterLog, line: usize, user: &UserRecord, row: &PersonRow) {
    if user.differs_from(row) {
        log.warning(
            Category::Existing,
            Some(line),
            format!(
                "{} already exists as \"{}\"; the stored name will be replaced by \"{}\"",
                user.email,
                user.as_person().display_name(),
                row.display_name()
            ),
        );
    }
    if !user.is_active {
        log.warning(
            Category::Inactive,
            Some(line),
            format!("{} is inactive and will be reactivated", user.email),
        );
    }
}

fn validate_persons(
    kind: ImportKind,
    rows: &[ImportRow],
    snapshot: &Snapshot,
    log: &mut ImporterLog,
) {
    // email -> (first line, first row)
    let mut seen: HashMap<String, (usize, &PersonRow)> = HashMap::new();
    let mut order: Vec<(usize, &PersonRow)> = Vec::new();

    for row in rows {
        let RowRecord::Person(person) = &row.record else {
            log.error(Category::Schema, Some(row.line), "row does not describe a person");
            continue;
        };
        if !check_person(log, row.line, "", person) {
            continue;
        }
        let email = clean_email(&person.email);
        match seen.get(&email) {
            Some(&(first_line, first)) if first.same_data(person) => {
                log.warning(
                    Category::Duplicate,
                    Some(row.line),
                    format!(
                        "{} appears again with identical data (first on line {}); the row is ignored",
                        email, first_line
                    ),
                );
            }
            Some(&(first_line, first)) => {
                log.error(
                    Category::Conflict,
                    Some(row.line),
                    format!(
                        "{} appears on line {} as \"{}\" and here as \"{}\"",
                        email,
                        first_line,
                        first.display_name(),
                        person.display_name()
                    ),
                );
            }
            None => {
                seen.insert(email, (row.line, person));
                order.push((row.line, person));
            }
        }
    }

    for (line, person) in order {
        let Some(user) = snapshot.user_by_email(&person.email) else {
            continue;
        };
        check_existing(log, line, user, person);
        if kind.is_membership() && snapshot.is_member(&user.id) {
            log.info(
                Category::Existing,
                Some(line),
                format!("{} is already a {} of this evaluation", user.email, kind.as_str()),
            );
        }
    }
}

fn validate_enrollments(rows: &[ImportRow], snapshot: &Snapshot, log: &mut ImporterLog) {
    let mut persons: HashMap<String, (usize, &PersonRow)> = HashMap::new();
    let mut person_order: Vec<(usize, &PersonRow)> = Vec::new();
    let mut courses: BTreeMap<String, (usize, &EnrollmentRow)> = BTreeMap::new();
    let mut course_order: Vec<(usize, &EnrollmentRow)> = Vec::new();
    let mut german_names: HashMap<String, (usize, String)> = HashMap::new();
    let mut enrollments: HashMap<(String, String), usize> = HashMap::new();
    let mut unknown_programs: HashSet<String> = HashSet::new();
    let mut unknown_kinds: HashSet<String> = HashSet::new();

    for row in rows {
        let RowRecord::Enrollment(e) = &row.record else {
            log.error(Category::Schema, Some(row.line), "row does not describe an enrollment");
            continue;
        };
        let line = row.line;
        let mut ok = true;
        for (value, label) in [
            (&e.program, "program"),
            (&e.course_kind, "course kind"),
            (&e.course_is_graded, "course is graded"),
            (&e.course_name_de, "course name (de)"),
            (&e.course_name_en, "course name (en)"),
        ] {
            if value.is_empty() {
                log.error(Category::MissingValue, Some(line), format!("{} is missing", label));
                ok = false;
            }
        }
        if !e.course_is_graded.is_empty() && parse_boolish(&e.course_is_graded).is_none() {
            log.error(
                Category::InvalidValue,
                Some(line),
                format!("\"{}\" is not a yes/no value for course is graded", e.course_is_graded),
            );
            ok = false;
        }
        let participant_ok = check_person(log, line, "participant ", &e.participant);
        let responsible_ok = check_person(log, line, "responsible ", &e.responsible);

        for (person, valid) in [(&e.participant, participant_ok), (&e.responsible, responsible_ok)] {
            if !valid {
                continue;
            }
            let email = clean_email(&person.email);
            match persons.get(&email) {
                Some(&(first_line, first)) => {
                    if names_conflict(first, person) {
                        log.error(
                            Category::Conflict,
                            Some(line),
                            format!(
                                "{} appears on line {} as \"{}\" and here as \"{}\"",
                                email,
                                first_line,
                                first.display_name(),
                                person.display_name()
                            ),
                        );
                    }
                }
                None => {
                    persons.insert(email, (line, person));
                    person_order.push((line, person));
                }
            }
        }

        if participant_ok
            && responsible_ok
            && clean_email(&e.participant.email) == clean_email(&e.responsible.email)
        {
            log.warning(
                Category::Conflict,
                Some(line),
                format!(
                    "{} is enrolled in \"{}\", a course they are responsible for",
                    clean_email(&e.participant.email),
                    e.course_name_en
                ),
            );
        }

        if !ok {
            continue;
        }

        let course_key = normalize_key(&e.course_name_en);
        match courses.get(&course_key) {
            Some(&(first_line, first)) => {
                for mismatch in course_mismatches(first, e) {
                    log.error(
                        Category::Conflict,
                        Some(line),
                        format!(
                            "course \"{}\" has a different {} than on line {}",
                            e.course_name_en, mismatch, first_line
                        ),
                    );
                }
            }
            None => {
                let de_key = normalize_key(&e.course_name_de);
                match german_names.get(&de_key) {
                    Some((first_line, other_en)) => log.error(
                        Category::Conflict,
                        Some(line),
                        format!(
                            "course name (de) \"{}\" is also used by \"{}\" on line {}",
                            e.course_name_de, other_en, first_line
                        ),
                    ),
                    None => {
                        german_names.insert(de_key, (line, e.course_name_en.clone()));
                    }
                }
                courses.insert(course_key.clone(), (line, e));
                course_order.push((line, e));
            }
        }

        if participant_ok {
            let key = (clean_email(&e.participant.email), course_key);
            if let Some(first_line) = enrollments.get(&key) {
                log.warning(
                    Category::Duplicate,
                    Some(line),
                    format!(
                        "{} is enrolled in \"{}\" again (first on line {}); the row is ignored",
                        key.0, e.course_name_en, first_line
                    ),
                );
            } else {
                enrollments.insert(key, line);
            }
        }

        if snapshot.program_by_name(&e.program).is_none()
            && unknown_programs.insert(normalize_key(&e.program))
        {
            log.info(
                Category::Plan,
                Some(line),
                format!("program \"{}\" does not exist and will be created", e.program),
            );
        }
        if snapshot.course_kind_by_name(&e.course_kind).is_none()
            && unknown_kinds.insert(normalize_key(&e.course_kind))
        {
            log.info(
                Category::Plan,
                Some(line),
                format!("course kind \"{}\" does not exist and will be created", e.course_kind),
            );
        }
    }

    for (line, person) in person_order {
        if let Some(user) = snapshot.user_by_email(&person.email) {
            check_existing(log, line, user, person);
        }
    }

    // Existing courses whose German name an earlier row changes, keyed by id.
    let mut renamed: HashMap<&str, String> = HashMap::new();
    for (line, e) in course_order {
        let existing = snapshot.course_by_name_en(&e.course_name_en);
        let de_key = normalize_key(&e.course_name_de);
        let holder = snapshot.courses.iter().find(|c| {
            normalize_key(&c.name_de) == de_key
                && existing.map_or(true, |x| x.id != c.id)
                && renamed.get(c.id.as_str()).map_or(true, |to| *to == de_key)
        });
        if let Some(other) = holder {
            log.error(
                Category::Conflict,
                Some(line),
                format!(
                    "course name (de) \"{}\" is already used by the existing course \"{}\"",
                    e.course_name_de, other.name_en
                ),
            );
        }

        let Some(existing) = existing else {
            continue;
        };
        let mut changes = Vec::new();
        if normalize_key(&existing.name_de) != de_key {
            changes.push("German name");
            renamed.insert(existing.id.as_str(), de_key.clone());
        }
        let kind_matches = snapshot
            .course_kind_by_name(&e.course_kind)
            .is_some_and(|k| k.id == existing.kind_id);
        if !kind_matches {
            changes.push("kind");
        }
        if parse_boolish(&e.course_is_graded) != Some(existing.is_graded) {
            changes.push("graded flag");
        }
        let program_listed = snapshot
            .program_by_name(&e.program)
            .is_some_and(|p| existing.program_ids.contains(&p.id));
        if !program_listed {
            changes.push("program");
        }
        let responsible_listed = snapshot
            .user_by_email(&e.responsible.email)
            .is_some_and(|u| existing.responsible_ids.contains(&u.id));
        if !responsible_listed {
            changes.push("responsible");
        }
        if !changes.is_empty() {
            log.warning(
                Category::Existing,
                Some(line),
                format!(
                    "course \"{}\" already exists; its {} will be updated",
                    existing.name_en,
                    changes.join(", ")
                ),
            );
        }
    }
}

fn course_mismatches(first: &EnrollmentRow, row: &EnrollmentRow) -> Vec<&'static str> {
    let mut out = Vec::new();
    if normalize_key(&first.course_name_de) != normalize_key(&row.course_name_de) {
        out.push("course name (de)");
    }
    if normalize_key(&first.course_kind) != normalize_key(&row.course_kind) {
        out.push("course kind");
    }
    if parse_boolish(&first.course_is_graded) != parse_boolish(&row.course_is_graded) {
        out.push("graded flag");
    }
    if normalize_key(&first.program) != normalize_key(&row.program) {
        out.push("program");
    }
    if clean_email(&first.responsible.email) != clean_email(&row.responsible.email) {
        out.push("responsible");
    }
    out
}

/// How an account line of a bulk update maps onto stored users.
#[derive(Debug)]
pub enum AccountMatch<'a> {
    Exact(&'a UserRecord),
    /// Same local part under an internal domain, e.g. after a domain move.
    LocalPart(&'a UserRecord),
    Ambiguous(usize),
    Unmatched,
}

pub fn match_account<'a>(
    snapshot: &'a Snapshot,
    settings: &ImportSettings,
    email: &str,
) -> AccountMatch<'a> {
    if let Some(user) = snapshot.user_by_email(email) {
        return AccountMatch::Exact(user);
    }
    let email = clean_email(email);
    let Some((local, _)) = email.split_once('@') else {
        return AccountMatch::Unmatched;
    };
    let candidates = snapshot
        .users
        .iter()
        .filter(|u| settings.is_internal_email(&u.email))
        .filter(|u| {
            clean_email(&u.email)
                .split_once('@')
                .is_some_and(|(l, _)| l == local)
        })
        .collect::<Vec<_>>();
    match candidates.as_slice() {
        [] => AccountMatch::Unmatched,
        [one] => AccountMatch::LocalPart(one),
        many => AccountMatch::Ambiguous(many.len()),
    }
}

fn validate_accounts(
    rows: &[ImportRow],
    snapshot: &Snapshot,
    settings: &ImportSettings,
    log: &mut ImporterLog,
) {
    let mut by_email: HashMap<String, (usize, &AccountRow)> = HashMap::new();
    let mut by_username: HashMap<String, (usize, String)> = HashMap::new();
    let mut matched: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let RowRecord::Account(account) = &row.record else {
            log.error(Category::Schema, Some(row.line), "row does not describe an account");
            continue;
        };
        let line = row.line;
        if account.username.is_empty() {
            log.error(Category::MissingValue, Some(line), "username is missing");
        }
        if account.email.is_empty() {
            log.error(Category::MissingValue, Some(line), "email is missing");
            continue;
        }
        if !is_valid_email(&account.email) {
            log.error(
                Category::InvalidValue,
                Some(line),
                format!("email \"{}\" is not a valid address", account.email),
            );
            continue;
        }
        let email = clean_email(&account.email);
        if !settings.is_internal_email(&email) {
            log.info(
                Category::Ignored,
                Some(line),
                format!("{} is not an internal address; the line is ignored", email),
            );
            continue;
        }
        if account.username.is_empty() {
            continue;
        }

        if let Some(&(first_line, first)) = by_email.get(&email) {
            if first.username == account.username {
                log.warning(
                    Category::Duplicate,
                    Some(line),
                    format!(
                        "{} appears again (first on line {}); the row is ignored",
                        email, first_line
                    ),
                );
            } else {
                log.error(
                    Category::Conflict,
                    Some(line),
                    format!(
                        "{} is given username \"{}\" here but \"{}\" on line {}",
                        email, account.username, first.username, first_line
                    ),
                );
            }
            continue;
        }
        by_email.insert(email.clone(), (line, account));

        let username_key = account.username.to_lowercase();
        if let Some((first_line, other_email)) = by_username.get(&username_key) {
            log.error(
                Category::Conflict,
                Some(line),
                format!(
                    "username \"{}\" is also given to {} on line {}",
                    account.username, other_email, first_line
                ),
            );
            continue;
        }
        by_username.insert(username_key, (line, email.clone()));

        let user = match match_account(snapshot, settings, &email) {
            AccountMatch::Ambiguous(n) => {
                log.error(
                    Category::Conflict,
                    Some(line),
                    format!("{} stored users match the local part of {}", n, email),
                );
                continue;
            }
            AccountMatch::Unmatched => {
                log.info(
                    Category::Plan,
                    Some(line),
                    format!("{} does not exist and will be created", email),
                );
                None
            }
            AccountMatch::Exact(user) => Some(user),
            AccountMatch::LocalPart(user) => {
                log.info(
                    Category::Existing,
                    Some(line),
                    format!("the email of {} will change to {}", user.email, email),
                );
                Some(user)
            }
        };

        if let Some(user) = user {
            if let Some(first_line) = matched.get(&user.id) {
                log.error(
                    Category::Conflict,
                    Some(line),
                    format!(
                        "{} matches the same stored user as line {} ({})",
                        email, first_line, user.email
                    ),
                );
                continue;
            }
            matched.insert(user.id.clone(), line);
            if let Some(holder) = snapshot.users.iter().find(|u| {
                u.id != user.id
                    && u.username
                        .as_deref()
                        .is_some_and(|n| n.eq_ignore_ascii_case(&account.username))
            }) {
                log.error(
                    Category::Conflict,
                    Some(line),
                    format!(
                        "username \"{}\" already belongs to {}",
                        account.username, holder.email
                    ),
                );
            }
            if !user.is_active {
                log.warning(
                    Category::Inactive,
                    Some(line),
                    format!("{} is inactive and will be reactivated", user.email),
                );
            }
        } else if let Some(holder) = snapshot.users.iter().find(|u| {
            u.username
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(&account.username))
        }) {
            log.error(
                Category::Conflict,
                Some(line),
                format!(
                    "username \"{}\" already belongs to {}",
                    account.username, holder.email
                ),
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::import::diagnostics::Severity;
    use crate::import::snapshot::{CourseKindRecord, CourseRecord, ProgramRecord};

    pub(crate) fn user(id: &str, email: &str, first: &str, last: &str) -> UserRecord {
        UserRecord {
            id: id.to_string(),
            username: None,
            email: email.to_string(),
            title: String::new(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            is_active: true,
            participations: 0,
            contributions: 0,
            responsibilities: 0,
        }
    }

    pub(crate) fn person_row(line: usize, title: &str, first: &str, last: &str, email: &str) -> ImportRow {
        ImportRow {
            line,
            record: RowRecord::Person(PersonRow {
                title: title.to_string(),
                first_name: first.to_string(),
                last_name: last.to_string(),
                email: email.to_string(),
            }),
        }
    }

    pub(crate) fn enrollment_row(
        line: usize,
        participant: &str,
        course_en: &str,
        course_de: &str,
        responsible: &str,
    ) -> ImportRow {
        ImportRow {
            line,
            record: RowRecord::Enrollment(EnrollmentRow {
                program: "Informatik".to_string(),
                participant: PersonRow {
                    title: String::new(),
                    first_name: "P".to_string(),
                    last_name: participant.split('@').next().unwrap_or("").to_string(),
                    email: participant.to_string(),
                },
                course_kind: "Lecture".to_string(),
                course_is_graded: "yes".to_string(),
                course_name_de: course_de.to_string(),
                course_name_en: course_en.to_string(),
                responsible: PersonRow {
                    title: "Prof.".to_string(),
                    first_name: "R".to_string(),
                    last_name: responsible.split('@').next().unwrap_or("").to_string(),
                    email: responsible.to_string(),
                },
            }),
        }
    }

    pub(crate) fn account_row(line: usize, username: &str, email: &str) -> ImportRow {
        ImportRow {
            line,
            record: RowRecord::Account(AccountRow {
                username: username.to_string(),
                email: email.to_string(),
            }),
        }
    }

    pub(crate) fn snapshot(kind: ImportKind, users: Vec<UserRecord>, members: &[&str]) -> Snapshot {
        Snapshot::new(
            kind,
            None,
            users,
            members.iter().map(|s| s.to_string()).collect(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
    }

    fn severities(v: &Validation) -> Vec<(Severity, Category, Option<usize>)> {
        v.log
            .entries()
            .iter()
            .map(|e| (e.severity, e.category, e.line))
            .collect()
    }

    #[test]
    fn single_clean_row_yields_empty_log() {
        let snap = snapshot(ImportKind::User, Vec::new(), &[]);
        let rows = vec![person_row(2, "Dr.", "Jane", "Doe", "jane@x.edu")];
        let v = validate_rows(ImportKind::User, &rows, &snap, &ImportSettings::default());
        assert!(v.validated);
        assert!(v.log.is_empty(), "{:?}", v.log);
    }

    #[test]
    fn missing_values_and_bad_email_are_errors() {
        let snap = snapshot(ImportKind::User, Vec::new(), &[]);
        let rows = vec![
            person_row(2, "", "", "Doe", "jane@x.edu"),
            person_row(3, "", "Max", "Muster", "not-an-email"),
        ];
        let v = validate_rows(ImportKind::User, &rows, &snap, &ImportSettings::default());
        assert!(!v.validated);
        assert_eq!(
            severities(&v),
            vec![
                (Severity::Error, Category::MissingValue, Some(2)),
                (Severity::Error, Category::InvalidValue, Some(3)),
            ]
        );
    }

    #[test]
    fn duplicates_warn_when_identical_and_fail_when_conflicting() {
        let snap = snapshot(ImportKind::User, Vec::new(), &[]);
        let rows = vec![
            person_row(2, "", "Jane", "Doe", "jane@x.edu"),
            person_row(3, "", "Jane", "Doe", "JANE@x.edu"),
        ];
        let v = validate_rows(ImportKind::User, &rows, &snap, &ImportSettings::default());
        assert!(v.validated);
        assert_eq!(
            severities(&v),
            vec![(Severity::Warning, Category::Duplicate, Some(3))]
        );

        let rows = vec![
            person_row(2, "", "Jane", "Doe", "jane@x.edu"),
            person_row(3, "", "Janet", "Doe", "jane@x.edu"),
        ];
        let v = validate_rows(ImportKind::User, &rows, &snap, &ImportSettings::default());
        assert!(!v.validated);
        assert_eq!(
            severities(&v),
            vec![(Severity::Error, Category::Conflict, Some(3))]
        );
    }

    #[test]
    fn existing_users_with_other_names_or_inactive_warn() {
        let mut inactive = user("u2", "max@x.edu", "Max", "Muster");
        inactive.is_active = false;
        let snap = snapshot(
            ImportKind::Participant,
            vec![user("u1", "jane@x.edu", "Jane", "Smith"), inactive],
            &["u2"],
        );
        let rows = vec![
            person_row(2, "", "Jane", "Doe", "jane@x.edu"),
            person_row(3, "", "Max", "Muster", "max@x.edu"),
        ];
        let v = validate_rows(ImportKind::Participant, &rows, &snap, &ImportSettings::default());
        assert!(v.validated);
        assert_eq!(
            severities(&v),
            vec![
                (Severity::Warning, Category::Existing, Some(2)),
                (Severity::Warning, Category::Inactive, Some(3)),
                (Severity::Info, Category::Existing, Some(3)),
            ]
        );
    }

    #[test]
    fn empty_upload_is_an_error() {
        let snap = snapshot(ImportKind::User, Vec::new(), &[]);
        let v = validate_rows(ImportKind::User, &[], &snap, &ImportSettings::default());
        assert!(!v.validated);
    }

    #[test]
    fn validation_is_repeatable() {
        let snap = snapshot(
            ImportKind::User,
            vec![user("u1", "jane@x.edu", "Jane", "Smith")],
            &[],
        );
        let rows = vec![
            person_row(2, "", "Jane", "Doe", "jane@x.edu"),
            person_row(3, "", "A", "B", "a@x.edu"),
            person_row(4, "", "A", "B", "a@x.edu"),
            person_row(5, "", "C", "", "c@x.edu"),
        ];
        let settings = ImportSettings::default();
        let first = validate_rows(ImportKind::User, &rows, &snap, &settings);
        let second = validate_rows(ImportKind::User, &rows, &snap, &settings);
        assert_eq!(first.log, second.log);
    }

    #[test]
    fn semester_course_rows_must_agree() {
        let snap = snapshot(ImportKind::Semester, Vec::new(), &[]);
        let mut conflicting = enrollment_row(3, "b@uni.edu", "Algorithms", "Algorithmen", "prof@uni.edu");
        if let RowRecord::Enrollment(e) = &mut conflicting.record {
            e.course_is_graded = "no".to_string();
        }
        let rows = vec![
            enrollment_row(2, "a@uni.edu", "Algorithms", "Algorithmen", "prof@uni.edu"),
            conflicting,
            enrollment_row(4, "a@uni.edu", "Databases", "Algorithmen", "prof@uni.edu"),
            enrollment_row(5, "a@uni.edu", "Algorithms", "Algorithmen", "prof@uni.edu"),
        ];
        let v = validate_rows(ImportKind::Semester, &rows, &snap, &ImportSettings::default());
        assert!(!v.validated);
        let found = severities(&v);
        assert!(found.contains(&(Severity::Error, Category::Conflict, Some(3))));
        assert!(found.contains(&(Severity::Error, Category::Conflict, Some(4))));
        assert!(found.contains(&(Severity::Warning, Category::Duplicate, Some(5))));
        assert!(found.contains(&(Severity::Info, Category::Plan, Some(2))));
    }

    #[test]
    fn semester_against_existing_courses() {
        let mut responsible = user("r1", "prof@uni.edu", "R", "prof");
        responsible.title = "Prof.".to_string();
        let snap = Snapshot::new(
            ImportKind::Semester,
            Some("s1".to_string()),
            vec![responsible],
            Vec::new(),
            vec![ProgramRecord {
                id: "p1".to_string(),
                name_de: "Informatik".to_string(),
                name_en: "Computer Science".to_string(),
            }],
            vec![CourseKindRecord {
                id: "k1".to_string(),
                name: "Lecture".to_string(),
            }],
            vec![CourseRecord {
                id: "c1".to_string(),
                name_de: "Datenbanken".to_string(),
                name_en: "Databases".to_string(),
                kind_id: "k1".to_string(),
                is_graded: false,
                program_ids: vec!["p1".to_string()],
                responsible_ids: vec!["r1".to_string()],
                evaluation_id: Some("e1".to_string()),
                participant_ids: Vec::new(),
            }],
        );
        let rows = vec![
            enrollment_row(2, "a@uni.edu", "Databases", "Datenbanken", "prof@uni.edu"),
            enrollment_row(3, "a@uni.edu", "Data Systems", "Datenbanken", "prof@uni.edu"),
        ];
        let v = validate_rows(ImportKind::Semester, &rows, &snap, &ImportSettings::default());
        let found = severities(&v);
        // Only the graded flag differs for the existing course; the new course clashes on its German name.
        assert!(found.contains(&(Severity::Warning, Category::Existing, Some(2))));
        assert!(found.contains(&(Severity::Error, Category::Conflict, Some(3))));
        assert!(!found.contains(&(Severity::Info, Category::Plan, Some(2))));
    }

    fn course(id: &str, name_en: &str, name_de: &str) -> CourseRecord {
        CourseRecord {
            id: id.to_string(),
            name_de: name_de.to_string(),
            name_en: name_en.to_string(),
            kind_id: "k1".to_string(),
            is_graded: true,
            program_ids: Vec::new(),
            responsible_ids: Vec::new(),
            evaluation_id: None,
            participant_ids: Vec::new(),
        }
    }

    fn semester_snapshot(courses: Vec<CourseRecord>) -> Snapshot {
        Snapshot::new(
            ImportKind::Semester,
            Some("s1".to_string()),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            vec![CourseKindRecord {
                id: "k1".to_string(),
                name: "Lecture".to_string(),
            }],
            courses,
        )
    }

    #[test]
    fn renaming_an_existing_course_onto_another_german_name_is_an_error() {
        let snap = semester_snapshot(vec![
            course("c1", "Databases", "Datenbanken"),
            course("c2", "Algorithms", "Algorithmen"),
        ]);
        let rows = vec![enrollment_row(2, "a@uni.edu", "Algorithms", "Datenbanken", "prof@uni.edu")];
        let v = validate_rows(ImportKind::Semester, &rows, &snap, &ImportSettings::default());
        assert!(!v.validated);
        assert!(severities(&v).contains(&(Severity::Error, Category::Conflict, Some(2))));
    }

    #[test]
    fn german_name_freed_by_an_earlier_row_can_be_reused() {
        let snap = semester_snapshot(vec![
            course("c1", "Databases", "Datenbanken"),
            course("c2", "Algorithms", "Algorithmen"),
        ]);
        let freed_first = vec![
            enrollment_row(2, "a@uni.edu", "Databases", "Datenbanksysteme", "prof@uni.edu"),
            enrollment_row(3, "a@uni.edu", "Algorithms", "Datenbanken", "prof@uni.edu"),
        ];
        let v = validate_rows(ImportKind::Semester, &freed_first, &snap, &ImportSettings::default());
        assert!(!severities(&v)
            .iter()
            .any(|(s, c, _)| *s == Severity::Error && *c == Category::Conflict));

        // The rename that frees the name must come first, or the update would collide.
        let freed_later = vec![
            enrollment_row(2, "a@uni.edu", "Algorithms", "Datenbanken", "prof@uni.edu"),
            enrollment_row(3, "a@uni.edu", "Databases", "Datenbanksysteme", "prof@uni.edu"),
        ];
        let v = validate_rows(ImportKind::Semester, &freed_later, &snap, &ImportSettings::default());
        assert!(severities(&v).contains(&(Severity::Error, Category::Conflict, Some(2))));
    }

    #[test]
    fn bulk_update_matches_local_part_and_ignores_external() {
        let settings = ImportSettings {
            internal_domains: vec!["uni.edu".to_string(), "inst.uni.edu".to_string()],
            ..ImportSettings::default()
        };
        let snap = snapshot(
            ImportKind::UserBulkUpdate,
            vec![
                user("u1", "jane@inst.uni.edu", "Jane", "Doe"),
                user("u2", "max@uni.edu", "Max", "A"),
                user("u3", "max@inst.uni.edu", "Max", "B"),
            ],
            &[],
        );
        let rows = vec![
            account_row(1, "jdoe", "jane@uni.edu"),
            account_row(2, "ext", "someone@gmail.com"),
            account_row(3, "max", "max@new.uni.edu"),
        ];
        assert!(matches!(
            match_account(&snap, &settings, "jane@uni.edu"),
            AccountMatch::LocalPart(u) if u.id == "u1"
        ));
        let v = validate_rows(ImportKind::UserBulkUpdate, &rows, &snap, &settings);
        assert_eq!(
            severities(&v),
            vec![
                (Severity::Info, Category::Existing, Some(1)),
                (Severity::Info, Category::Ignored, Some(2)),
                (Severity::Info, Category::Ignored, Some(3)),
            ]
        );

        let rows = vec![account_row(1, "max", "max@uni.edu"), account_row(2, "max2", "max@inst.uni.edu")];
        let v = validate_rows(ImportKind::UserBulkUpdate, &rows, &snap, &settings);
        assert!(v.validated, "{:?}", v.log);

        let settings = ImportSettings {
            internal_domains: vec!["uni.edu".to_string(), "inst.uni.edu".to_string(), "new.uni.edu".to_string()],
            ..ImportSettings::default()
        };
        let rows = vec![account_row(1, "max", "max@new.uni.edu")];
        let v = validate_rows(ImportKind::UserBulkUpdate, &rows, &snap, &settings);
        assert_eq!(
            severities(&v),
            vec![(Severity::Error, Category::Conflict, Some(1))]
        );
    }
}
