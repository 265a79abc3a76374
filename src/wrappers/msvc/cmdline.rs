// Purpose: Parse the cl.exe flag grammar into a structured model and re-emit canonical forms.
// Inputs/Outputs: Consumes argv plus CL/_CL_ wrapping and response files; produces parser state.
// Invariants: Re-emission must reach a fixed point: parse(merge(parse(x))) merges identically.
// Gotchas: cl.exe options may implicitly modify related option state, and the
// colon/no-colon argument rules differ per option family.

use anyhow::{bail, Context, Result};
use std::fs;

use crate::path_utils::{append_path, change_extension, ends_with_separator, get_extension};

/// cl.exe prepends/appends the contents of these variables to the command
/// line it interprets.
pub const ENV_CL_PREFIX: &str = "CL";
pub const ENV_CL_POSTFIX: &str = "_CL_";

/// Bound on response-file recursion. The limit used by cl.exe itself is
/// undocumented; this one is deliberately generous.
pub const RESPONSE_FILE_MAX_DEPTH: usize = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputType {
    Unknown,
    #[default]
    Object,
    C,
    Cpp,
}

pub fn filename_to_type(name: &str) -> InputType {
    let ext = get_extension(name).to_ascii_lowercase();
    match ext.as_str() {
        ".c" => InputType::C,
        ".cpp" | ".cxx" | ".cc" => InputType::Cpp,
        _ => InputType::Object,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DebugFormat {
    #[default]
    None,
    /// /Z7: debug info embedded in the object file.
    ObjectFile,
    /// /Zi: debug info in a shared pdb.
    SeparateFile,
    /// /ZI: shared pdb with edit-and-continue support.
    SeparateFileEditAndContinue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    All,
    /// Drop includes, defines and /Fo:, for keys derived from preprocessed
    /// source where those are already reflected in the content.
    SkipCoveredByPreprocess,
    /// Common arguments for direct-mode keys; the input-type flag moves into
    /// the per-input content payload, and inputs are bound per miss.
    DirectModeCommonArgs,
    /// Everything but the input files; the caller appends inputs itself.
    SkipInputs,
}

#[derive(Clone, Debug)]
pub struct InputFile {
    pub name: String,
    pub declared_type: InputType,
}

#[derive(Clone, Debug, Default)]
pub struct FlagOption {
    pub enabled: bool,
    pub value: String,
}

#[derive(Clone, Debug, Default)]
pub struct PchConfig {
    pub create: FlagOption,
    pub use_pch: FlagOption,
    pub path: String,
    pub ignore: bool,
}

impl PchConfig {
    pub fn is_create(&self) -> bool {
        !self.ignore && self.create.enabled
    }

    /// Resolves the pch output path for one input file.
    pub fn output_path(&self, input_file: &str, default_name: &str) -> String {
        if self.path.is_empty() {
            return change_extension(input_file, ".pch");
        }
        if ends_with_separator(&self.path) {
            return append_path(&self.path, default_name);
        }
        change_extension(&self.path, ".pch")
    }
}

/// Parses the subset of cl.exe command line syntax needed to extract info
/// and rewrite the compilation command.
///
/// Resolving concrete values of all arguments (e.g. "/WX /WX- /WX" matching
/// any other sequence that effectively enables /WX) would raise the hit rate
/// further, but build-system invocations are stable enough that the ROI is
/// small.
#[derive(Debug, Default)]
pub struct CmdlineParser {
    response_depth: usize,
    pub compile_only: bool,
    pub default_input_type: InputType,
    pub debug_format: DebugFormat,
    pub includes: Vec<String>,
    pub defines: Vec<String>,
    pub options: Vec<String>,
    pub pdb_path: String,
    pub object_path: String,
    pub pch: PchConfig,
    pub input_files: Vec<InputFile>,
}

impl CmdlineParser {
    /// Parses argv[1..] wrapped in the CL / _CL_ environment variables.
    pub fn parse(&mut self, argv: &[String]) -> Result<()> {
        let prefix = std::env::var(ENV_CL_PREFIX).ok();
        let postfix = std::env::var(ENV_CL_POSTFIX).ok();
        self.parse_wrapped(argv, prefix.as_deref(), postfix.as_deref())
    }

    pub fn parse_wrapped(
        &mut self,
        argv: &[String],
        prefix: Option<&str>,
        postfix: Option<&str>,
    ) -> Result<()> {
        if let Some(line) = prefix {
            self.parse_line(line)?;
        }
        if argv.len() > 1 {
            self.parse_list(&argv[1..])?;
        }
        if let Some(line) = postfix {
            self.parse_line(line)?;
        }
        Ok(())
    }

    pub fn parse_line(&mut self, line: &str) -> Result<()> {
        self.parse_list(&split_args(line))
    }

    pub fn parse_list(&mut self, tokens: &[String]) -> Result<()> {
        let mut index = 0;
        while index < tokens.len() {
            let item = &tokens[index];
            if let Some(option) = option_body(item) {
                if option == "link" {
                    // Do not add /link or any following items from this line.
                    break;
                } else if option == "c" {
                    self.compile_only = true;
                } else if option == "TC" {
                    self.default_input_type = InputType::C;
                } else if option == "TP" {
                    self.default_input_type = InputType::Cpp;
                } else if option == "Y-" {
                    self.pch.ignore = true;
                } else if option == "Z7" {
                    self.debug_format = DebugFormat::ObjectFile;
                } else if option == "Zi" {
                    self.debug_format = DebugFormat::SeparateFile;
                } else if option == "ZI" {
                    self.debug_format = DebugFormat::SeparateFileEditAndContinue;
                } else if let Some(rest) = option.strip_prefix("Fd") {
                    self.pdb_path = sanitize_path(&retrieve_colon_arg(rest, tokens, &mut index)?);
                } else if let Some(rest) = option.strip_prefix("Fo") {
                    self.object_path = sanitize_path(&retrieve_colon_arg(rest, tokens, &mut index)?);
                } else if let Some(rest) = option.strip_prefix("Fp") {
                    self.pch.path = sanitize_path(&retrieve_colon_arg(rest, tokens, &mut index)?);
                } else if let Some(rest) = option.strip_prefix('D') {
                    self.defines.push(retrieve_arg(rest, tokens, &mut index)?);
                } else if let Some(rest) = option.strip_prefix('I') {
                    self.includes
                        .push(sanitize_path(&retrieve_arg(rest, tokens, &mut index)?));
                } else if let Some(rest) = option.strip_prefix("Tc") {
                    let name = sanitize_path(&retrieve_arg(rest, tokens, &mut index)?);
                    self.append_file(name, InputType::C);
                } else if let Some(rest) = option.strip_prefix("Tp") {
                    let name = sanitize_path(&retrieve_arg(rest, tokens, &mut index)?);
                    self.append_file(name, InputType::Cpp);
                } else if let Some(rest) = option.strip_prefix("Yc") {
                    self.pch.create.enabled = true;
                    self.pch.create.value = sanitize_path(rest);
                } else if let Some(rest) = option.strip_prefix("Yu") {
                    self.pch.use_pch.enabled = true;
                    self.pch.use_pch.value = sanitize_path(rest);
                } else {
                    // Not something we specially handle.
                    self.options.push(option.to_string());
                }
            } else if let Some(name) = item.strip_prefix('@') {
                // Inline the file; the response-file token itself is not kept.
                self.parse_file(name)?;
            } else {
                self.append_file(item.clone(), InputType::Unknown);
            }
            index += 1;
        }
        Ok(())
    }

    fn parse_file(&mut self, name: &str) -> Result<()> {
        self.response_depth += 1;
        if self.response_depth > RESPONSE_FILE_MAX_DEPTH {
            bail!("response file nesting deeper than {}", RESPONSE_FILE_MAX_DEPTH);
        }
        let text = read_response_file(name)?;
        for line in text.lines() {
            self.parse_line(line)?;
        }
        self.response_depth -= 1;
        Ok(())
    }

    fn append_file(&mut self, name: String, declared_type: InputType) {
        self.input_files.push(InputFile {
            name,
            declared_type,
        });
    }

    pub fn input_file_by_name(&self, name: &str) -> Result<&InputFile> {
        self.input_files
            .iter()
            .find(|file| file.name == name)
            .with_context(|| format!("unknown input file {}", name))
    }

    pub fn effective_file_type(&self, file: &InputFile) -> InputType {
        if file.declared_type != InputType::Unknown {
            return file.declared_type;
        }
        match self.default_input_type {
            InputType::C | InputType::Cpp => self.default_input_type,
            _ => filename_to_type(&file.name),
        }
    }

    /// The canonical argument form of one input file.
    pub fn input_arg(&self, file: &InputFile) -> String {
        match self.effective_file_type(file) {
            InputType::C => format!("/Tc{}", file.name),
            InputType::Cpp => format!("/Tp{}", file.name),
            _ => file.name.clone(),
        }
    }

    // The canonical type flag announces a concrete language when every input
    // resolves to the same one, so that equivalent spellings converge.
    fn emitted_default_type(&self) -> InputType {
        match self.default_input_type {
            InputType::C | InputType::Cpp => self.default_input_type,
            _ => {
                let mut common = InputType::Unknown;
                for file in &self.input_files {
                    let ty = self.effective_file_type(file);
                    if !matches!(ty, InputType::C | InputType::Cpp) {
                        return InputType::Unknown;
                    }
                    if common == InputType::Unknown {
                        common = ty;
                    } else if common != ty {
                        return InputType::Unknown;
                    }
                }
                common
            }
        }
    }

    /// Re-emits the parsed state as a canonical argument list.
    pub fn merge(&self, mode: MergeMode) -> Vec<String> {
        let mut cmdline: Vec<String> = Vec::new();
        if self.compile_only {
            cmdline.push("/c".to_string());
        }
        if mode != MergeMode::DirectModeCommonArgs {
            match self.emitted_default_type() {
                InputType::C => cmdline.push("/TC".to_string()),
                InputType::Cpp => cmdline.push("/TP".to_string()),
                _ => {}
            }
        }
        match self.debug_format {
            DebugFormat::ObjectFile => cmdline.push("/Z7".to_string()),
            DebugFormat::SeparateFile => cmdline.push("/Zi".to_string()),
            DebugFormat::SeparateFileEditAndContinue => cmdline.push("/ZI".to_string()),
            DebugFormat::None => {}
        }
        for option in &self.options {
            cmdline.push(format!("/{}", option));
        }
        if !self.pdb_path.is_empty() {
            cmdline.push(format!("/Fd:{}", self.pdb_path));
        }
        if mode != MergeMode::SkipCoveredByPreprocess {
            for include in &self.includes {
                cmdline.push("/I".to_string());
                cmdline.push(include.clone());
            }
            for define in &self.defines {
                cmdline.push("/D".to_string());
                cmdline.push(define.clone());
            }
            if !self.object_path.is_empty() {
                cmdline.push(format!("/Fo:{}", self.object_path));
            }
        }
        if self.pch.create.enabled {
            cmdline.push(format!("/Yc{}", self.pch.create.value));
        }
        if self.pch.use_pch.enabled {
            cmdline.push(format!("/Yu{}", self.pch.use_pch.value));
        }
        if self.pch.ignore {
            cmdline.push("/Y-".to_string());
        }
        if !self.pch.path.is_empty() {
            cmdline.push(format!("/Fp:{}", self.pch.path));
        }
        if mode == MergeMode::All {
            for file in &self.input_files {
                cmdline.push(self.input_arg(file));
            }
        }
        cmdline
    }

    pub fn obj_path_is_dir(&self) -> bool {
        // An empty object path means the current directory.
        self.object_path.is_empty() || ends_with_separator(&self.object_path)
    }
}

fn option_body(item: &str) -> Option<&str> {
    let first = item.chars().next()?;
    if first == '/' || first == '-' {
        Some(&item[1..])
    } else {
        None
    }
}

/// Argument retrieval for suffix-valued options (/D, /I, /Tc, /Tp): an
/// empty suffix takes the next token.
fn retrieve_arg(suffix: &str, tokens: &[String], index: &mut usize) -> Result<String> {
    if !suffix.is_empty() {
        return Ok(suffix.to_string());
    }
    *index += 1;
    tokens
        .get(*index)
        .cloned()
        .context("expected another argument")
}

/// Argument retrieval for options with an optional colon separator (/Fd,
/// /Fo, /Fp). A colon-less empty suffix may take the next token; a
/// colon-present empty suffix must not.
fn retrieve_colon_arg(suffix: &str, tokens: &[String], index: &mut usize) -> Result<String> {
    let had_colon = suffix.starts_with(':');
    let arg = if had_colon { &suffix[1..] } else { suffix };
    if !arg.is_empty() {
        return Ok(arg.to_string());
    }
    if had_colon {
        bail!("expected an argument after the colon");
    }
    *index += 1;
    tokens
        .get(*index)
        .cloned()
        .context("expected another argument")
}

/// Upper-cases a leading drive letter. This improves the hit rate only; it
/// is not required for correct operation.
fn sanitize_path(path: &str) -> String {
    let bytes = path.as_bytes();
    if path.len() > 2 && bytes[1] == b':' {
        let mut out = String::with_capacity(path.len());
        out.push(bytes[0].to_ascii_uppercase() as char);
        out.push_str(&path[1..]);
        return out;
    }
    path.to_string()
}

/// Splits a command line into arguments, honoring double quotes.
pub fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

/// Reads a response file, decoding UTF-16LE with BOM, UTF-8 with BOM, or
/// raw UTF-8.
fn read_response_file(path: &str) -> Result<String> {
    let raw = fs::read(path).with_context(|| format!("read response file {}", path))?;
    if raw.len() > 2 && raw.len() % 2 == 0 && raw[0] == 0xff && raw[1] == 0xfe {
        let units: Vec<u16> = raw[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return Ok(String::from_utf16_lossy(&units));
    }
    if raw.len() > 3 && raw[0] == 0xef && raw[1] == 0xbb && raw[2] == 0xbf {
        return Ok(String::from_utf8_lossy(&raw[3..]).into_owned());
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}
