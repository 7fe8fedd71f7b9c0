use super::ImportKind;
use serde::Serialize;

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub key: &'static str,
    pub header: &'static str,
    pub aliases: &'static [&'static str],
    pub required: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub kind: ImportKind,
    pub columns: &'static [Column],
    pub has_header: bool,
}

impl Schema {
    pub fn for_kind(kind: ImportKind) -> Self {
        let (columns, has_header) = match kind {
            ImportKind::User | ImportKind::Participant | ImportKind::Contributor => {
                (PERSON_COLUMNS, true)
            }
            ImportKind::Semester => (ENROLLMENT_COLUMNS, true),
            ImportKind::UserBulkUpdate => (ACCOUNT_COLUMNS, false),
        };
        Self {
            kind,
            columns,
            has_header,
        }
    }

    pub fn headers(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.header).collect()
    }

    /// Finds the column a header cell refers to.
    pub fn match_header(&self, cell: &str) -> Option<&'static Column> {
        let norm = normalize_header(cell);
        if norm.is_empty() {
            return None;
        }
        self.columns.iter().find(|c| {
            normalize_header(c.header) == norm || c.aliases.iter().any(|a| normalize_header(a) == norm)
        })
    }
}

fn normalize_header(s: &str) -> String {
    s.trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

const PERSON_COLUMNS: &[Column] = &[
    Column {
        key: "title",
        header: "Title",
        aliases: &["academic title"],
        required: false,
    },
    Column {
        key: "first_name",
        header: "First name",
        aliases: &["firstname", "given name"],
        required: true,
    },
    Column {
        key: "last_name",
        header: "Last name",
        aliases: &["lastname", "surname", "family name"],
        required: true,
    },
    Column {
        key: "email",
        header: "Email",
        aliases: &["e-mail", "email address", "mail"],
        required: true,
    },
];

const ENROLLMENT_COLUMNS: &[Column] = &[
    Column {
        key: "program",
        header: "Program",
        aliases: &["degree", "study program"],
        required: true,
    },
    Column {
        key: "participant_last_name",
        header: "Participant last name",
        aliases: &["student last name"],
        required: true,
    },
    Column {
        key: "participant_first_name",
        header: "Participant first name",
        aliases: &["student first name"],
        required: true,
    },
    Column {
        key: "participant_email",
        header: "Participant email",
        aliases: &["student email", "participant e-mail"],
        required: true,
    },
    Column {
        key: "course_kind",
        header: "Course kind",
        aliases: &["course type"],
        required: true,
    },
    Column {
        key: "course_is_graded",
        header: "Course is graded",
        aliases: &["is graded", "graded"],
        required: true,
    },
    Column {
        key: "course_name_de",
        header: "Course name (de)",
        aliases: &["course name de", "course name german"],
        required: true,
    },
    Column {
        key: "course_name_en",
        header: "Course name (en)",
        aliases: &["course name en", "course name english"],
        required: true,
    },
    Column {
        key: "responsible_title",
        header: "Responsible title",
        aliases: &[],
        required: false,
    },
    Column {
        key: "responsible_last_name",
        header: "Responsible last name",
        aliases: &[],
        required: true,
    },
    Column {
        key: "responsible_first_name",
        header: "Responsible first name",
        aliases: &[],
        required: true,
    },
    Column {
        key: "responsible_email",
        header: "Responsible email",
        aliases: &["responsible e-mail"],
        required: true,
    },
];

const ACCOUNT_COLUMNS: &[Column] = &[
    Column {
        key: "username",
        header: "Username",
        aliases: &[],
        required: true,
    },
    Column {
        key: "email",
        header: "Email",
        aliases: &[],
        required: true,
    },
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersonRow {
    pub title: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl PersonRow {
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if self.title.is_empty() {
            name.to_string()
        } else {
            format!("{} {}", self.title, name)
        }
    }

    /// Same person data once emails are normalized.
    pub fn same_data(&self, other: &PersonRow) -> bool {
        self.title == other.title
            && self.first_name == other.first_name
            && self.last_name == other.last_name
            && clean_email(&self.email) == clean_email(&other.email)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrollmentRow {
    pub program: String,
    pub participant: PersonRow,
    pub course_kind: String,
    pub course_is_graded: String,
    pub course_name_de: String,
    pub course_name_en: String,
    pub responsible: PersonRow,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountRow {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RowRecord {
    Person(PersonRow),
    Enrollment(EnrollmentRow),
    Account(AccountRow),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportRow {
    /// 1-based line in the sheet, counting the header line.
    pub line: usize,
    pub record: RowRecord,
}

impl ImportRow {
    /// Maps a cell lookup (by column key) into the kind's typed record.
    pub fn from_cells<'a>(
        kind: ImportKind,
        line: usize,
        cell: impl Fn(&str) -> Option<&'a str>,
    ) -> Self {
        let get = |key: &str| cell(key).map(|s| s.trim().to_string()).unwrap_or_default();
        let record = match kind {
            ImportKind::User | ImportKind::Participant | ImportKind::Contributor => {
                RowRecord::Person(PersonRow {
                    title: get("title"),
                    first_name: get("first_name"),
                    last_name: get("last_name"),
                    email: get("email"),
                })
            }
            ImportKind::Semester => RowRecord::Enrollment(EnrollmentRow {
                program: get("program"),
                participant: PersonRow {
                    title: String::new(),
                    first_name: get("participant_first_name"),
                    last_name: get("participant_last_name"),
                    email: get("participant_email"),
                },
                course_kind: get("course_kind"),
                course_is_graded: get("course_is_graded"),
                course_name_de: get("course_name_de"),
                course_name_en: get("course_name_en"),
                responsible: PersonRow {
                    title: get("responsible_title"),
                    first_name: get("responsible_first_name"),
                    last_name: get("responsible_last_name"),
                    email: get("responsible_email"),
                },
            }),
            ImportKind::UserBulkUpdate => RowRecord::Account(AccountRow {
                username: get("username"),
                email: get("email"),
            }),
        };
        Self { line, record }
    }
}

/// Canonical form used as the identity of a user.
pub fn clean_email(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

pub fn is_valid_email(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() || s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let labels = domain.split('.').collect::<Vec<_>>();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

pub fn parse_boolish(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "ja" | "x" => Some(true),
        "0" | "false" | "no" | "n" | "nein" => Some(false),
        _ => None,
    }
}

pub fn normalize_key(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_matching_ignores_case_and_punctuation() {
        let schema = Schema::for_kind(ImportKind::User);
        assert_eq!(schema.match_header(" first_name ").map(|c| c.key), Some("first_name"));
        assert_eq!(schema.match_header("E-Mail").map(|c| c.key), Some("email"));
        assert_eq!(schema.match_header("Surname").map(|c| c.key), Some("last_name"));
        assert!(schema.match_header("Matrikelnummer").is_none());

        let semester = Schema::for_kind(ImportKind::Semester);
        assert_eq!(
            semester.match_header("Course name (en)").map(|c| c.key),
            Some("course_name_en")
        );
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("jane@x.edu"));
        assert!(is_valid_email("  Jane.Doe@Inst.Uni.EDU "));
        assert!(!is_valid_email("jane"));
        assert!(!is_valid_email("jane@localhost"));
        assert!(!is_valid_email("ja ne@x.edu"));
        assert!(!is_valid_email("@x.edu"));
        assert!(!is_valid_email("jane@x..edu"));
        assert!(!is_valid_email("a@b@x.edu"));
        assert_eq!(clean_email(" Jane@X.EDU "), "jane@x.edu");
    }

    #[test]
    fn boolish_accepts_german_answers() {
        assert_eq!(parse_boolish("ja"), Some(true));
        assert_eq!(parse_boolish("Nein"), Some(false));
        assert_eq!(parse_boolish("maybe"), None);
    }
}
