//! Transcription prompts.

use clap::ValueEnum;

/// Which transcription prompt to use. Different kinds of page need different
/// instructions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum PromptVariant {
    /// Letters, minutes and despatches.
    #[default]
    General,
    /// Returns, ledgers and other tables.
    Tabular,
    /// Manuscript pages.
    Handwritten,
}

impl PromptVariant {
    /// The name recorded in page metadata.
    pub fn key(self) -> &'static str {
        match self {
            PromptVariant::General => "general",
            PromptVariant::Tabular => "tabular",
            PromptVariant::Handwritten => "handwritten",
        }
    }

    pub fn prompt(self) -> &'static str {
        match self {
            PromptVariant::General => GENERAL_PROMPT,
            PromptVariant::Tabular => TABULAR_PROMPT,
            PromptVariant::Handwritten => HANDWRITTEN_PROMPT,
        }
    }
}

const GENERAL_PROMPT: &str = "\
Transcribe every piece of text in this scanned page from a 19th-century \
colonial archive. Keep the original spelling, punctuation and line breaks. \
Write [illegible] wherever a word cannot be read. Include printed headings, \
stamps, docket notes and marginalia. Return only the transcription.";

const TABULAR_PROMPT: &str = "\
This scanned page from a 19th-century colonial archive contains a table or \
return. Transcribe it as a Markdown table, one row per printed or written \
row, keeping column headings, units and totals exactly as shown. Write \
[illegible] for any cell that cannot be read. Transcribe any text outside the \
table above or below it. Return only the transcription.";

const HANDWRITTEN_PROMPT: &str = "\
This is a handwritten page from a 19th-century colonial archive. Transcribe \
it line by line, keeping the writer's spelling, abbreviations and \
punctuation. Do not modernise or expand anything. Write [illegible] for each \
word you cannot read, and include interlinear additions and marginal notes \
where they appear. Return only the transcription.";
