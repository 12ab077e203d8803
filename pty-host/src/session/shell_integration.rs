// Shell integration injection
//
// Rewrites a shell's launch arguments and environment so that it sources the
// integration script on startup. Only argument vectors we fully understand are
// rewritten; anything else fails and the shell launches untouched.

use super::environment::path_prepend_values;
use super::protocol::{OperatingSystem, ShellLaunchConfig, TerminalProcessOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Variables the integration script reports back when env reporting is on
const SHELL_ENV_REPORTING_VARS: &[&str] = &["PATH", "VIRTUAL_ENV", "HOME", "SHELL", "PWD"];

/// Minimum Windows build with the conpty features integration relies on
const MIN_CONPTY_BUILD: u32 = 18309;
const MIN_ENV_REPORTING_BUILD: u32 = 22631;

const PWSH_LOGIN_ARGS: &[&str] = &["-login", "-l"];
const SH_LOGIN_ARGS: &[&str] = &["--login", "-l"];
const SH_INTERACTIVE_ARGS: &[&str] = &["-i", "--interactive"];
const PWSH_IMPLIED_ARGS: &[&str] = &["-nol", "-nologo"];

/// Shells the injector knows how to integrate with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellType {
    Bash,
    Zsh,
    Fish,
    Pwsh,
}

impl ShellType {
    /// Parse the shell type from an executable path as it would be resolved on `platform`
    pub fn from_path(path: &str, platform: OperatingSystem) -> Option<Self> {
        let name = shell_basename(path, platform);
        match (platform, name.as_str()) {
            (OperatingSystem::Windows, "pwsh.exe" | "powershell.exe") => Some(ShellType::Pwsh),
            (OperatingSystem::Windows, "bash.exe") => Some(ShellType::Bash),
            (OperatingSystem::Windows, _) => None,
            (_, "bash") => Some(ShellType::Bash),
            (_, "zsh") => Some(ShellType::Zsh),
            (_, "fish") => Some(ShellType::Fish),
            (_, "pwsh") => Some(ShellType::Pwsh),
            _ => None,
        }
    }
}

impl std::fmt::Display for ShellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellType::Bash => write!(f, "bash"),
            ShellType::Zsh => write!(f, "zsh"),
            ShellType::Fish => write!(f, "fish"),
            ShellType::Pwsh => write!(f, "pwsh"),
        }
    }
}

impl std::str::FromStr for ShellType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bash" => Ok(ShellType::Bash),
            "zsh" => Ok(ShellType::Zsh),
            "fish" => Ok(ShellType::Fish),
            "pwsh" | "powershell" => Ok(ShellType::Pwsh),
            _ => Err(format!("Unsupported shell: {}", s)),
        }
    }
}

/// File name of an executable; lower-cased on Windows where names are case-insensitive
fn shell_basename(path: &str, platform: OperatingSystem) -> String {
    let name = if platform == OperatingSystem::Windows {
        path.rsplit(['/', '\\']).next().unwrap_or(path)
    } else {
        path.rsplit('/').next().unwrap_or(path)
    };
    if platform == OperatingSystem::Windows {
        name.to_lowercase()
    } else {
        name.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InjectionFailureReason {
    InjectionSettingDisabled,
    NoExecutable,
    FeatureTerminal,
    IgnoreShellIntegrationFlag,
    Winpty,
    UnsupportedArgs,
    UnsupportedShell,
    FailedToSetStickyBit,
    FailedToCreateTmpDir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileToCopy {
    pub source: PathBuf,
    pub dest: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellIntegrationInjection {
    pub new_args: Vec<String>,
    pub env_mixin: HashMap<String, String>,
    pub files_to_copy: Vec<FileToCopy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionResult {
    Injection(ShellIntegrationInjection),
    /// The shell must be launched unmodified. `nonce` is set once the
    /// executable was resolved so callers can still export it.
    Failure {
        reason: InjectionFailureReason,
        nonce: Option<String>,
    },
}

impl InjectionResult {
    fn failure(reason: InjectionFailureReason) -> Self {
        InjectionResult::Failure {
            reason,
            nonce: None,
        }
    }

    pub fn failure_reason(&self) -> Option<InjectionFailureReason> {
        match self {
            InjectionResult::Failure { reason, .. } => Some(*reason),
            InjectionResult::Injection(_) => None,
        }
    }
}

/// Host facts the injector depends on, gathered once per launch
#[derive(Debug, Clone)]
pub struct InjectionContext {
    pub platform: OperatingSystem,
    pub windows_build_number: u32,
    /// Directory containing `scripts/`
    pub app_root: PathBuf,
    pub app_name: String,
    pub is_stable_quality: bool,
    pub tmp_dir: PathBuf,
    pub username: String,
    pub home_dir: Option<PathBuf>,
}

impl InjectionContext {
    /// Build a context describing the current host
    pub fn from_env() -> Self {
        let app_root = std::env::var_os("PTY_HOST_APP_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")));
        let tmp_dir = std::env::temp_dir();
        let tmp_dir = fs::canonicalize(&tmp_dir).unwrap_or(tmp_dir);
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            platform: OperatingSystem::current(),
            windows_build_number: super::system::windows_build_number(),
            app_root,
            app_name: "pty-host".to_string(),
            is_stable_quality: std::env::var("PTY_HOST_QUALITY").map_or(true, |q| q == "stable"),
            tmp_dir,
            username,
            home_dir: dirs::home_dir(),
        }
    }

    fn script(&self, name: &str) -> String {
        let sep = if self.platform == OperatingSystem::Windows { "\\" } else { "/" };
        format!("{}{sep}scripts{sep}{}", self.app_root.display(), name)
    }
}

fn arg_in(arg: &str, set: &[&str]) -> bool {
    set.contains(&arg.to_lowercase().as_str())
}

fn are_pwsh_implied_args(args: &[String]) -> bool {
    args.is_empty() || (args.len() == 1 && arg_in(&args[0], PWSH_IMPLIED_ARGS))
}

fn are_pwsh_login_args(args: &[String]) -> bool {
    match args {
        [a] => arg_in(a, PWSH_LOGIN_ARGS),
        [a, b] => {
            (arg_in(a, PWSH_LOGIN_ARGS) && arg_in(b, PWSH_IMPLIED_ARGS))
                || (arg_in(b, PWSH_LOGIN_ARGS) && arg_in(a, PWSH_IMPLIED_ARGS))
        }
        _ => false,
    }
}

fn are_sh_login_args(args: &[String]) -> bool {
    let remaining: Vec<&String> = args
        .iter()
        .filter(|a| !arg_in(a, SH_INTERACTIVE_ARGS))
        .collect();
    remaining.len() == 1 && arg_in(remaining[0], SH_LOGIN_ARGS)
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Set `VSCODE_PATH_PREFIX` so PATH prepends survive the shell's own profile
fn add_path_prefix(
    ctx: &InjectionContext,
    options: &TerminalProcessOptions,
    shell: ShellType,
    env_mixin: &mut HashMap<String, String>,
) {
    if ctx.platform != OperatingSystem::Macintosh && shell != ShellType::Fish {
        return;
    }
    let Some(collections) = options.environment_variable_collections.as_deref() else {
        return;
    };
    let prefix = path_prepend_values(collections, options.workspace_folder.as_deref()).join("");
    if !prefix.is_empty() {
        env_mixin.insert("VSCODE_PATH_PREFIX".to_string(), prefix);
    }
}

/// Create the zsh dotfile directory with owner-only + sticky permissions
/// before anything is written into it.
fn prepare_zdotdir(zdotdir: &Path) -> Result<(), InjectionFailureReason> {
    match set_sticky_owner_only(zdotdir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            if let Err(err) = fs::create_dir_all(zdotdir) {
                tracing::error!("Failed to create zdotdir at {}: {}", zdotdir.display(), err);
                return Err(InjectionFailureReason::FailedToCreateTmpDir);
            }
            set_sticky_owner_only(zdotdir).map_err(|err| {
                tracing::error!("Failed to set sticky bit on {}: {}", zdotdir.display(), err);
                InjectionFailureReason::FailedToSetStickyBit
            })
        }
        Err(err) => {
            tracing::error!("Failed to set sticky bit on {}: {}", zdotdir.display(), err);
            Err(InjectionFailureReason::FailedToSetStickyBit)
        }
    }
}

#[cfg(unix)]
fn set_sticky_owner_only(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o1700))
}

#[cfg(not(unix))]
fn set_sticky_owner_only(dir: &Path) -> std::io::Result<()> {
    fs::metadata(dir).map(|_| ())
}

/// Compute how to launch `launch_config` with shell integration.
///
/// `env` is the environment the shell will inherit; it is only consulted for
/// the user's own `ZDOTDIR`.
pub fn get_shell_integration_injection(
    launch_config: &ShellLaunchConfig,
    options: &TerminalProcessOptions,
    env: &HashMap<String, String>,
    ctx: &InjectionContext,
) -> InjectionResult {
    use InjectionFailureReason::*;

    if !options.shell_integration.enabled {
        return InjectionResult::failure(InjectionSettingDisabled);
    }
    let Some(executable) = launch_config.executable.as_deref() else {
        return InjectionResult::failure(NoExecutable);
    };
    if launch_config.is_feature_terminal && !launch_config.force_shell_integration {
        return InjectionResult::failure(FeatureTerminal);
    }
    if launch_config.ignore_shell_integration {
        return InjectionResult::failure(IgnoreShellIntegrationFlag);
    }
    let is_windows = ctx.platform == OperatingSystem::Windows;
    if is_windows && (!options.windows_enable_conpty || ctx.windows_build_number < MIN_CONPTY_BUILD) {
        return InjectionResult::failure(Winpty);
    }

    let nonce = options.shell_integration.nonce.clone();
    let fail = |reason| InjectionResult::Failure {
        reason,
        nonce: nonce.clone(),
    };

    let basename = shell_basename(executable, ctx.platform);
    let mut env_mixin = HashMap::new();
    env_mixin.insert("VSCODE_INJECTION".to_string(), "1".to_string());
    if let Some(nonce) = &nonce {
        env_mixin.insert("VSCODE_NONCE".to_string(), nonce.clone());
    }
    if launch_config.shell_integration_environment_reporting {
        let enabled = !is_windows
            || options.windows_use_conpty_dll
            || (options.windows_enable_conpty
                && ctx.windows_build_number >= MIN_ENV_REPORTING_BUILD
                && basename != "bash.exe");
        if enabled {
            env_mixin.insert(
                "VSCODE_SHELL_ENV_REPORTING".to_string(),
                SHELL_ENV_REPORTING_VARS.join(","),
            );
        }
    }

    let Some(shell) = ShellType::from_path(executable, ctx.platform) else {
        tracing::warn!("Shell integration cannot be enabled for executable \"{}\"", executable);
        return fail(UnsupportedShell);
    };
    let stable = if ctx.is_stable_quality { "1" } else { "0" };
    let original_args = launch_config.args.as_deref().unwrap_or(&[]);
    let app_root = ctx.app_root.display().to_string();
    let mut files_to_copy = Vec::new();

    let new_args = match shell {
        ShellType::Pwsh => {
            let login = if are_pwsh_implied_args(original_args) {
                false
            } else if are_pwsh_login_args(original_args) {
                true
            } else {
                return fail(UnsupportedArgs);
            };
            let command = if is_windows {
                format!("try {{ . \"{}\" }} catch {{}}", ctx.script("shellIntegration.ps1"))
            } else {
                format!(". \"{}\"", ctx.script("shellIntegration.ps1"))
            };
            let mut args = if login { strings(&["-l"]) } else { Vec::new() };
            args.extend(strings(&["-noexit", "-command"]));
            args.push(command);
            if options.is_screen_reader_optimized {
                env_mixin.insert("VSCODE_A11Y_MODE".to_string(), "1".to_string());
            }
            if options.shell_integration.suggest_enabled {
                env_mixin.insert("VSCODE_SUGGEST".to_string(), "1".to_string());
            }
            env_mixin.insert("VSCODE_STABLE".to_string(), stable.to_string());
            args
        }
        ShellType::Bash => {
            if !original_args.is_empty() {
                if !are_sh_login_args(original_args) {
                    return fail(UnsupportedArgs);
                }
                env_mixin.insert("VSCODE_SHELL_LOGIN".to_string(), "1".to_string());
                add_path_prefix(ctx, options, shell, &mut env_mixin);
            }
            env_mixin.insert("VSCODE_STABLE".to_string(), stable.to_string());
            vec!["--init-file".to_string(), ctx.script("shellIntegration-bash.sh")]
        }
        ShellType::Fish => {
            let mut args = Vec::new();
            if !original_args.is_empty() {
                if !are_sh_login_args(original_args) {
                    return fail(UnsupportedArgs);
                }
                env_mixin.insert("VSCODE_SHELL_LOGIN".to_string(), "1".to_string());
                args.push("-l".to_string());
            }
            add_path_prefix(ctx, options, shell, &mut env_mixin);
            args.push("--init-command".to_string());
            args.push(format!("source \"{}\"", ctx.script("shellIntegration.fish")));
            args
        }
        ShellType::Zsh => {
            let args = if original_args.is_empty() {
                strings(&["-i"])
            } else if are_sh_login_args(original_args) {
                env_mixin.insert("VSCODE_SHELL_LOGIN".to_string(), "1".to_string());
                add_path_prefix(ctx, options, shell, &mut env_mixin);
                strings(&["-il"])
            } else {
                return fail(UnsupportedArgs);
            };

            let zdotdir = ctx
                .tmp_dir
                .join(format!("{}-{}-zsh", ctx.username, ctx.app_name));
            if let Err(reason) = prepare_zdotdir(&zdotdir) {
                return fail(reason);
            }
            env_mixin.insert("ZDOTDIR".to_string(), zdotdir.display().to_string());
            let user_zdotdir = env
                .get("ZDOTDIR")
                .cloned()
                .or_else(|| ctx.home_dir.as_ref().map(|h| h.display().to_string()))
                .unwrap_or_else(|| "~".to_string());
            env_mixin.insert("USER_ZDOTDIR".to_string(), user_zdotdir);

            for (script, dotfile) in [
                ("shellIntegration-rc.zsh", ".zshrc"),
                ("shellIntegration-profile.zsh", ".zprofile"),
                ("shellIntegration-env.zsh", ".zshenv"),
                ("shellIntegration-login.zsh", ".zlogin"),
            ] {
                files_to_copy.push(FileToCopy {
                    source: PathBuf::from(&app_root).join("scripts").join(script),
                    dest: zdotdir.join(dotfile),
                });
            }
            args
        }
    };

    InjectionResult::Injection(ShellIntegrationInjection {
        new_args,
        env_mixin,
        files_to_copy,
    })
}

/// Copy the integration files an injection asked for, e.g. zsh dotfiles
pub fn copy_injection_files(files: &[FileToCopy]) -> anyhow::Result<()> {
    use anyhow::Context;
    for file in files {
        fs::copy(&file.source, &file.dest).with_context(|| {
            format!(
                "Failed to copy {} to {}",
                file.source.display(),
                file.dest.display()
            )
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::environment::{
        EnvironmentVariableCollection, EnvironmentVariableMutator, MutatorType,
    };
    use crate::session::protocol::ShellIntegrationConfig;
    use tempfile::TempDir;

    fn context(platform: OperatingSystem, tmp: &Path) -> InjectionContext {
        InjectionContext {
            platform,
            windows_build_number: 22631,
            app_root: PathBuf::from("/app"),
            app_name: "pty-host".into(),
            is_stable_quality: true,
            tmp_dir: tmp.to_path_buf(),
            username: "tester".into(),
            home_dir: Some(PathBuf::from("/home/tester")),
        }
    }

    fn enabled_options() -> TerminalProcessOptions {
        TerminalProcessOptions {
            shell_integration: ShellIntegrationConfig {
                enabled: true,
                nonce: Some("abc123".into()),
                suggest_enabled: false,
            },
            windows_enable_conpty: true,
            ..Default::default()
        }
    }

    fn launch(executable: &str, args: Option<&[&str]>) -> ShellLaunchConfig {
        ShellLaunchConfig {
            executable: Some(executable.into()),
            args: args.map(strings),
            ..Default::default()
        }
    }

    fn path_collections() -> Option<Vec<EnvironmentVariableCollection>> {
        Some(vec![EnvironmentVariableCollection {
            extension_id: "ext".into(),
            mutators: vec![EnvironmentVariableMutator {
                variable: "PATH".into(),
                value: "/ext/bin:".into(),
                kind: MutatorType::Prepend,
                scope: None,
            }],
        }])
    }

    fn inject(config: &ShellLaunchConfig, options: &TerminalProcessOptions, ctx: &InjectionContext) -> ShellIntegrationInjection {
        match get_shell_integration_injection(config, options, &HashMap::new(), ctx) {
            InjectionResult::Injection(injection) => injection,
            other => panic!("Expected injection, got {:?}", other),
        }
    }

    #[test]
    fn test_shell_type_detection() {
        let linux = OperatingSystem::Linux;
        assert_eq!(ShellType::from_path("/bin/zsh", linux), Some(ShellType::Zsh));
        assert_eq!(ShellType::from_path("/usr/local/bin/fish", linux), Some(ShellType::Fish));
        assert_eq!(ShellType::from_path("/bin/sh", linux), None);
        assert_eq!(
            ShellType::from_path(r"C:\Program Files\PowerShell\7\PWSH.EXE", OperatingSystem::Windows),
            Some(ShellType::Pwsh)
        );
        assert_eq!("PowerShell".parse::<ShellType>(), Ok(ShellType::Pwsh));
        assert!("tcsh".parse::<ShellType>().is_err());
    }

    #[test]
    fn test_pwsh_implied_args_converge() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(OperatingSystem::Linux, tmp.path());
        let options = enabled_options();

        let expected = inject(&launch("pwsh", None), &options, &ctx);
        assert_eq!(
            expected.new_args,
            vec!["-noexit", "-command", ". \"/app/scripts/shellIntegration.ps1\""]
        );
        assert_eq!(expected.env_mixin.get("VSCODE_INJECTION").map(String::as_str), Some("1"));
        assert_eq!(expected.env_mixin.get("VSCODE_NONCE").map(String::as_str), Some("abc123"));
        assert_eq!(expected.env_mixin.get("VSCODE_STABLE").map(String::as_str), Some("1"));

        for args in [&[][..], &["-NoLogo"][..], &["-NOLOGO"][..], &["-nol"][..]] {
            let actual = inject(&launch("pwsh", Some(args)), &options, &ctx);
            assert_eq!(actual, expected, "args {:?}", args);
        }
    }

    #[test]
    fn test_pwsh_login_args() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(OperatingSystem::Linux, tmp.path());
        let options = enabled_options();

        let login = inject(&launch("pwsh", Some(&["-l"])), &options, &ctx);
        assert_eq!(login.new_args[0], "-l");
        let combined = inject(&launch("pwsh", Some(&["-NoLogo", "-Login"])), &options, &ctx);
        assert_eq!(combined, login);

        let result = get_shell_integration_injection(
            &launch("pwsh", Some(&["-File", "x.ps1"])),
            &options,
            &HashMap::new(),
            &ctx,
        );
        assert_eq!(
            result,
            InjectionResult::Failure {
                reason: InjectionFailureReason::UnsupportedArgs,
                nonce: Some("abc123".into())
            }
        );
    }

    #[test]
    fn test_windows_pwsh_wraps_in_try_and_sets_a11y() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = context(OperatingSystem::Windows, tmp.path());
        ctx.app_root = PathBuf::from(r"C:\app");
        let mut options = enabled_options();
        options.is_screen_reader_optimized = true;

        let injection = inject(&launch(r"C:\Windows\powershell.exe", None), &options, &ctx);
        assert_eq!(
            injection.new_args[2],
            r#"try { . "C:\app\scripts\shellIntegration.ps1" } catch {}"#
        );
        assert_eq!(injection.env_mixin.get("VSCODE_A11Y_MODE").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_pwsh_suggest_follows_options() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(OperatingSystem::Linux, tmp.path());
        let mut options = enabled_options();

        let plain = inject(&launch("pwsh", None), &options, &ctx);
        assert!(!plain.env_mixin.contains_key("VSCODE_SUGGEST"));

        options.shell_integration.suggest_enabled = true;
        let suggest = inject(&launch("pwsh", None), &options, &ctx);
        assert_eq!(suggest.env_mixin.get("VSCODE_SUGGEST").map(String::as_str), Some("1"));

        let bash = inject(&launch("bash", None), &options, &ctx);
        assert!(!bash.env_mixin.contains_key("VSCODE_SUGGEST"));
    }

    #[test]
    fn test_bash_login_sets_shell_login() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(OperatingSystem::Linux, tmp.path());
        let options = enabled_options();

        let plain = inject(&launch("/bin/bash", None), &options, &ctx);
        assert_eq!(plain.new_args, vec!["--init-file", "/app/scripts/shellIntegration-bash.sh"]);
        assert!(!plain.env_mixin.contains_key("VSCODE_SHELL_LOGIN"));

        for args in [&["-l"][..], &["--login"][..], &["-i", "--login"][..]] {
            let login = inject(&launch("/bin/bash", Some(args)), &options, &ctx);
            assert_eq!(login.new_args, plain.new_args);
            assert_eq!(login.env_mixin.get("VSCODE_SHELL_LOGIN").map(String::as_str), Some("1"));
            // PATH prefix only applies on macOS for bash
            assert!(!login.env_mixin.contains_key("VSCODE_PATH_PREFIX"));
        }
    }

    #[test]
    fn test_fish_gets_path_prefix_everywhere() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(OperatingSystem::Linux, tmp.path());
        let mut options = enabled_options();
        options.environment_variable_collections = path_collections();

        let login = inject(&launch("/usr/bin/fish", Some(&["-l"])), &options, &ctx);
        assert_eq!(
            login.new_args,
            vec!["-l", "--init-command", "source \"/app/scripts/shellIntegration.fish\""]
        );
        assert_eq!(login.env_mixin.get("VSCODE_SHELL_LOGIN").map(String::as_str), Some("1"));
        assert_eq!(login.env_mixin.get("VSCODE_PATH_PREFIX").map(String::as_str), Some("/ext/bin:"));

        let plain = inject(&launch("/usr/bin/fish", None), &options, &ctx);
        assert_eq!(plain.env_mixin.get("VSCODE_PATH_PREFIX").map(String::as_str), Some("/ext/bin:"));
    }

    #[cfg(unix)]
    #[test]
    fn test_zsh_writes_sticky_zdotdir() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let ctx = context(OperatingSystem::Macintosh, tmp.path());
        let mut options = enabled_options();
        options.environment_variable_collections = path_collections();

        let injection = inject(&launch("/bin/zsh", Some(&["-l"])), &options, &ctx);
        assert_eq!(injection.new_args, vec!["-il"]);
        assert_eq!(injection.env_mixin.get("VSCODE_SHELL_LOGIN").map(String::as_str), Some("1"));
        assert_eq!(injection.env_mixin.get("VSCODE_PATH_PREFIX").map(String::as_str), Some("/ext/bin:"));
        assert_eq!(
            injection.env_mixin.get("USER_ZDOTDIR").map(String::as_str),
            Some("/home/tester")
        );

        let zdotdir = tmp.path().join("tester-pty-host-zsh");
        assert_eq!(
            injection.env_mixin.get("ZDOTDIR").map(String::as_str),
            Some(zdotdir.to_str().unwrap())
        );
        let mode = fs::metadata(&zdotdir).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o1700);

        let dests: Vec<_> = injection.files_to_copy.iter().map(|f| f.dest.clone()).collect();
        for name in [".zshrc", ".zprofile", ".zshenv", ".zlogin"] {
            assert!(dests.contains(&zdotdir.join(name)), "missing {}", name);
        }
    }

    #[test]
    fn test_zsh_respects_user_zdotdir() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(OperatingSystem::Linux, tmp.path());
        let mut env = HashMap::new();
        env.insert("ZDOTDIR".to_string(), "/custom/zdot".to_string());

        let result =
            get_shell_integration_injection(&launch("zsh", None), &enabled_options(), &env, &ctx);
        match result {
            InjectionResult::Injection(injection) => {
                assert_eq!(injection.new_args, vec!["-i"]);
                assert_eq!(
                    injection.env_mixin.get("USER_ZDOTDIR").map(String::as_str),
                    Some("/custom/zdot")
                );
                assert!(!injection.env_mixin.contains_key("VSCODE_PATH_PREFIX"));
            }
            other => panic!("Expected injection, got {:?}", other),
        }
    }

    #[test]
    fn test_disabled_setting_always_fails_first() {
        let tmp = TempDir::new().unwrap();
        let mut options = enabled_options();
        options.shell_integration.enabled = false;

        for platform in [OperatingSystem::Linux, OperatingSystem::Macintosh, OperatingSystem::Windows] {
            let ctx = context(platform, tmp.path());
            for exe in ["bash", "zsh", "fish", "pwsh", "pwsh.exe", "bash.exe", "cmd.exe", "nu"] {
                for args in [None, Some(&["-l"][..]), Some(&["--weird"][..])] {
                    let mut config = launch(exe, args);
                    config.is_feature_terminal = true;
                    let result = get_shell_integration_injection(&config, &options, &HashMap::new(), &ctx);
                    assert_eq!(
                        result.failure_reason(),
                        Some(InjectionFailureReason::InjectionSettingDisabled)
                    );
                }
            }
        }
    }

    #[test]
    fn test_failure_order() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(OperatingSystem::Linux, tmp.path());
        let options = enabled_options();
        let check = |config: &ShellLaunchConfig, ctx: &InjectionContext, options: &TerminalProcessOptions| {
            get_shell_integration_injection(config, options, &HashMap::new(), ctx).failure_reason()
        };

        let no_exe = ShellLaunchConfig::default();
        assert_eq!(check(&no_exe, &ctx, &options), Some(InjectionFailureReason::NoExecutable));

        let mut feature = launch("bash", None);
        feature.is_feature_terminal = true;
        feature.ignore_shell_integration = true;
        assert_eq!(check(&feature, &ctx, &options), Some(InjectionFailureReason::FeatureTerminal));

        feature.force_shell_integration = true;
        assert_eq!(
            check(&feature, &ctx, &options),
            Some(InjectionFailureReason::IgnoreShellIntegrationFlag)
        );

        let mut win_ctx = context(OperatingSystem::Windows, tmp.path());
        win_ctx.windows_build_number = 17763;
        assert_eq!(check(&launch("pwsh.exe", None), &win_ctx, &options), Some(InjectionFailureReason::Winpty));

        assert_eq!(
            get_shell_integration_injection(&launch("/bin/tcsh", None), &options, &HashMap::new(), &ctx),
            InjectionResult::Failure {
                reason: InjectionFailureReason::UnsupportedShell,
                nonce: Some("abc123".into())
            }
        );
    }

    #[test]
    fn test_env_reporting_exempts_windows_bash() {
        let tmp = TempDir::new().unwrap();
        let options = enabled_options();
        let mut config = launch("bash", None);
        config.shell_integration_environment_reporting = true;

        let linux = inject(&config, &options, &context(OperatingSystem::Linux, tmp.path()));
        assert_eq!(
            linux.env_mixin.get("VSCODE_SHELL_ENV_REPORTING").map(String::as_str),
            Some("PATH,VIRTUAL_ENV,HOME,SHELL,PWD")
        );

        config.executable = Some(r"C:\Git\bin\bash.exe".into());
        let windows = inject(&config, &options, &context(OperatingSystem::Windows, tmp.path()));
        assert!(!windows.env_mixin.contains_key("VSCODE_SHELL_ENV_REPORTING"));
    }
}
