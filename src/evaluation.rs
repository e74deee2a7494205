use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;

use log::info;
use serde::Deserialize;
use serde_json::Value;

use crate::fields::{parse_fields, FieldParseError};

pub const DEFAULT_SECTION: &str = "DEFAULT";

const VERDICT_CORRECT: &str = "correct";
const VERDICT_INCORRECT: &str = "incorrect";
const VERDICT_UNMARKED: &str = "unmarked";

#[derive(Debug)]
pub enum EvaluationError {
    Io(String, std::io::Error),
    Parse(String, serde_json::Error),
    Field(FieldParseError),
    MissingDefaultScheme,
    BadMarkingValue { context: String, value: String },
    UnrecognizedAnswer { question: String, answer: String },
    AnswerCountMismatch { questions: usize, answers: usize },
    QuestionClaimedTwice { question: String, section: String },
    UnknownSourceType(String),
}

impl Display for EvaluationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluationError::Io(path, e) => write!(f, "error reading {}: {}", path, e),
            EvaluationError::Parse(path, e) => write!(f, "error parsing {}: {}", path, e),
            EvaluationError::Field(e) => write!(f, "{}", e),
            EvaluationError::MissingDefaultScheme => {
                write!(f, "marking schemes must include a '{}' entry", DEFAULT_SECTION)
            }
            EvaluationError::BadMarkingValue { context, value } => {
                write!(f, "{}: '{}' is not a number or 'n/d' fraction", context, value)
            }
            EvaluationError::UnrecognizedAnswer { question, answer } => write!(
                f,
                "answer for '{}' has an unrecognized shape: {}",
                question, answer
            ),
            EvaluationError::AnswerCountMismatch { questions, answers } => write!(
                f,
                "{} questions but {} answers in the key",
                questions, answers
            ),
            EvaluationError::QuestionClaimedTwice { question, section } => write!(
                f,
                "question '{}' claimed by section '{}' is already covered by another section",
                question, section
            ),
            EvaluationError::UnknownSourceType(s) => {
                write!(f, "unknown evaluation source_type '{}'", s)
            }
        }
    }
}

impl From<FieldParseError> for EvaluationError {
    fn from(e: FieldParseError) -> Self {
        EvaluationError::Field(e)
    }
}

/// Accepts a plain number or an `"n/d"` fraction string.
pub fn parse_float_or_fraction(context: &str, value: &Value) -> Result<f64, EvaluationError> {
    let bad = || EvaluationError::BadMarkingValue {
        context: context.to_string(),
        value: value.to_string(),
    };

    match value {
        Value::Number(n) => n.as_f64().ok_or_else(bad),
        Value::String(s) => match s.split_once('/') {
            Some((numerator, denominator)) => {
                let n: f64 = numerator.trim().parse().map_err(|_| bad())?;
                let d: f64 = denominator.trim().parse().map_err(|_| bad())?;
                if d == 0.0 {
                    return Err(bad());
                }
                Ok(n / d)
            }
            None => s.trim().parse().map_err(|_| bad()),
        },
        _ => Err(bad()),
    }
}

/// One question's answer key, classified by shape at construction time.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerMatcher {
    /// A single expected value.
    Standard(String),
    /// Any of these values earns the full `correct` credit.
    MultipleCorrect(Vec<String>),
    /// Each allowed value carries its own credit.
    MultipleCorrectWeighted(Vec<(String, f64)>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum AnswerJson {
    Single(String),
    Set(Vec<String>),
    Weighted(Vec<(String, Value)>),
}

impl AnswerMatcher {
    pub fn parse(question: &str, answer: &Value) -> Result<Self, EvaluationError> {
        let parsed: AnswerJson = serde_json::from_value(answer.clone()).map_err(|_| {
            EvaluationError::UnrecognizedAnswer {
                question: question.to_string(),
                answer: answer.to_string(),
            }
        })?;

        Ok(match parsed {
            AnswerJson::Single(value) => AnswerMatcher::Standard(value),
            AnswerJson::Set(values) => AnswerMatcher::MultipleCorrect(values),
            AnswerJson::Weighted(pairs) => {
                let mut weighted = Vec::with_capacity(pairs.len());
                for (value, weight) in pairs {
                    let weight = parse_float_or_fraction(
                        &format!("weight of '{}' for question '{}'", value, question),
                        &weight,
                    )?;
                    weighted.push((value, weight));
                }
                AnswerMatcher::MultipleCorrectWeighted(weighted)
            }
        })
    }

    /// Resolves the verdict for a marked response. Matched set/weighted
    /// answers carry the matched value in the verdict so per-value credit
    /// can be looked up.
    pub fn verdict(&self, marked: &str, empty_value: &str) -> String {
        if marked == empty_value {
            return VERDICT_UNMARKED.to_string();
        }
        match self {
            AnswerMatcher::Standard(key) => {
                if marked == key {
                    VERDICT_CORRECT.to_string()
                } else {
                    VERDICT_INCORRECT.to_string()
                }
            }
            AnswerMatcher::MultipleCorrect(values) => {
                if values.iter().any(|v| v == marked) {
                    format!("{}-{}", VERDICT_CORRECT, marked)
                } else {
                    VERDICT_INCORRECT.to_string()
                }
            }
            AnswerMatcher::MultipleCorrectWeighted(pairs) => {
                if pairs.iter().any(|(v, _)| v == marked) {
                    format!("{}-{}", VERDICT_CORRECT, marked)
                } else {
                    VERDICT_INCORRECT.to_string()
                }
            }
        }
    }
}

/// Credit table for one section of questions.
#[derive(Debug, Clone)]
pub struct SectionMarkingScheme {
    pub section: String,
    correct: f64,
    incorrect: f64,
    unmarked: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MarkingJson {
    correct: Value,
    incorrect: Value,
    unmarked: Value,
}

impl SectionMarkingScheme {
    fn new(section: &str, marking: &MarkingJson) -> Result<Self, EvaluationError> {
        let credit = |verdict: &str, value: &Value| {
            parse_float_or_fraction(
                &format!("'{}' credit in section '{}'", verdict, section),
                value,
            )
        };
        Ok(Self {
            section: section.to_string(),
            correct: credit(VERDICT_CORRECT, &marking.correct)?,
            incorrect: credit(VERDICT_INCORRECT, &marking.incorrect)?,
            unmarked: credit(VERDICT_UNMARKED, &marking.unmarked)?,
        })
    }

    /// Unknown verdict keys earn the `incorrect` credit.
    pub fn credit(&self, verdict: &str) -> f64 {
        match verdict {
            VERDICT_CORRECT => self.correct,
            VERDICT_UNMARKED => self.unmarked,
            _ => self.incorrect,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct EvaluationJson {
    source_type: String,
    options: Value,
    marking_schemes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CsvOptions {
    answer_key_csv_path: String,
    #[serde(default)]
    should_explain_scoring: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CustomOptions {
    questions_in_order: Vec<String>,
    answers_in_order: Vec<Value>,
    #[serde(default)]
    should_explain_scoring: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SchemeJson {
    Section {
        questions: Vec<String>,
        marking: MarkingJson,
    },
    Bare(MarkingJson),
}

/// Answer key plus marking schemes, built once per directory of sheets.
pub struct EvaluationConfig {
    questions: Vec<(String, AnswerMatcher, usize)>,
    schemes: Vec<SectionMarkingScheme>,
    should_explain_scoring: bool,
    empty_value: String,
}

impl EvaluationConfig {
    pub fn load(path: &Path, empty_value: &str) -> Result<Self, EvaluationError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| EvaluationError::Io(path.display().to_string(), e))?;
        let parsed: EvaluationJson = serde_json::from_str(&json)
            .map_err(|e| EvaluationError::Parse(path.display().to_string(), e))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(parsed, base_dir, empty_value)
    }

    fn from_json(
        json: EvaluationJson,
        base_dir: &Path,
        empty_value: &str,
    ) -> Result<Self, EvaluationError> {
        let (answer_items, should_explain_scoring): (Vec<(String, Value)>, bool) =
            match json.source_type.as_str() {
                "csv" => {
                    let options: CsvOptions = parse_opts(json.options, "csv")?;
                    let key_path = base_dir.join(&options.answer_key_csv_path);
                    let items = read_answer_key_csv(&key_path)?;
                    (items, options.should_explain_scoring)
                }
                "custom" => {
                    let options: CustomOptions = parse_opts(json.options, "custom")?;
                    let questions = parse_fields("questions_in_order", &options.questions_in_order)?;
                    if questions.len() != options.answers_in_order.len() {
                        return Err(EvaluationError::AnswerCountMismatch {
                            questions: questions.len(),
                            answers: options.answers_in_order.len(),
                        });
                    }
                    let items = questions
                        .into_iter()
                        .zip(options.answers_in_order)
                        .collect();
                    (items, options.should_explain_scoring)
                }
                other => return Err(EvaluationError::UnknownSourceType(other.to_string())),
            };

        // marking schemes: DEFAULT is required, named sections claim
        // question ranges away from it
        let mut schemes = Vec::new();
        let mut section_by_question: BTreeMap<String, usize> = BTreeMap::new();

        let default_json = json
            .marking_schemes
            .get(DEFAULT_SECTION)
            .ok_or(EvaluationError::MissingDefaultScheme)?;
        let default_marking: MarkingJson = serde_json::from_value(default_json.clone())
            .map_err(|e| EvaluationError::Parse(format!("section '{}'", DEFAULT_SECTION), e))?;
        schemes.push(SectionMarkingScheme::new(DEFAULT_SECTION, &default_marking)?);

        for (section, value) in &json.marking_schemes {
            if section == DEFAULT_SECTION {
                continue;
            }
            let parsed: SchemeJson = serde_json::from_value(value.clone())
                .map_err(|e| EvaluationError::Parse(format!("section '{}'", section), e))?;
            let (question_strings, marking) = match parsed {
                SchemeJson::Section { questions, marking } => (questions, marking),
                SchemeJson::Bare(marking) => (Vec::new(), marking),
            };
            let index = schemes.len();
            schemes.push(SectionMarkingScheme::new(section, &marking)?);
            for question in parse_fields(&format!("section '{}'", section), &question_strings)? {
                if section_by_question.insert(question.clone(), index).is_some() {
                    return Err(EvaluationError::QuestionClaimedTwice {
                        question,
                        section: section.clone(),
                    });
                }
            }
        }

        let mut questions = Vec::with_capacity(answer_items.len());
        for (question, answer) in answer_items {
            let matcher = AnswerMatcher::parse(&question, &answer)?;
            let scheme = section_by_question.get(&question).copied().unwrap_or(0);
            questions.push((question, matcher, scheme));
        }

        Ok(Self {
            questions,
            schemes,
            should_explain_scoring,
            empty_value: empty_value.to_string(),
        })
    }

    /// Sums credit over every keyed question present in the response.
    /// Questions missing from the response are skipped entirely.
    pub fn evaluate(&self, response: &BTreeMap<String, String>) -> f64 {
        let mut score = 0.0;
        for (question, matcher, scheme_index) in &self.questions {
            let Some(marked) = response.get(question) else {
                continue;
            };
            let scheme = &self.schemes[*scheme_index];
            let verdict = matcher.verdict(marked, &self.empty_value);
            let delta = self.credit(matcher, scheme, &verdict);
            if self.should_explain_scoring {
                info!(
                    "{}: marked '{}' -> {} ({:+}) [{}]",
                    question, marked, verdict, delta, scheme.section
                );
            }
            score += delta;
        }
        score
    }

    fn credit(
        &self,
        matcher: &AnswerMatcher,
        scheme: &SectionMarkingScheme,
        verdict: &str,
    ) -> f64 {
        if let Some(matched) = verdict.strip_prefix(&format!("{}-", VERDICT_CORRECT)) {
            return match matcher {
                AnswerMatcher::MultipleCorrectWeighted(pairs) => pairs
                    .iter()
                    .find(|(value, _)| value == matched)
                    .map(|(_, weight)| *weight)
                    .unwrap_or_else(|| scheme.credit(VERDICT_INCORRECT)),
                _ => scheme.credit(VERDICT_CORRECT),
            };
        }
        scheme.credit(verdict)
    }
}

fn parse_opts<T: serde::de::DeserializeOwned>(
    options: Value,
    name: &str,
) -> Result<T, EvaluationError> {
    let options = if options.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        options
    };
    serde_json::from_value(options)
        .map_err(|e| EvaluationError::Parse(format!("{} options", name), e))
}

/// Reads a `question,answer` key file. Answer cells written as Python-style
/// lists (`['A', 'B']` or `[['A', 1], ['B', 0.5]]`) are converted to JSON.
fn read_answer_key_csv(path: &Path) -> Result<Vec<(String, Value)>, EvaluationError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| EvaluationError::Io(path.display().to_string(), e))?;

    let mut items = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (question, answer_cell) = line.split_once(',').ok_or_else(|| {
            EvaluationError::UnrecognizedAnswer {
                question: line.to_string(),
                answer: String::new(),
            }
        })?;
        let question = question.trim().to_string();
        let cell = answer_cell.trim();
        let answer = if cell.starts_with('[') {
            let as_json = cell.replace('\'', "\"");
            serde_json::from_str(&as_json).map_err(|_| EvaluationError::UnrecognizedAnswer {
                question: question.clone(),
                answer: cell.to_string(),
            })?
        } else {
            Value::String(cell.to_string())
        };
        items.push((question, answer));
    }
    Ok(items)
}
