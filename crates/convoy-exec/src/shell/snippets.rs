//! PowerShell script fragments

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};

/// Single-quoted PowerShell string literal
#[must_use]
pub fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Literal here-string; the body may contain anything but a line
/// starting with `'@`
#[must_use]
pub fn here_string(value: &str) -> String {
    format!("@'\n{value}\n'@")
}

/// Run `command` with UTF-8 console streams and propagate its exit code
#[must_use]
pub fn execute_process(command: &str) -> String {
    format!(
        r#"if ([Console]::InputEncoding -eq [System.Text.Encoding]::UTF8) {{
  [Console]::InputEncoding = New-Object System.Text.UTF8Encoding $False
}}
if ([Console]::OutputEncoding -eq [System.Text.Encoding]::UTF8) {{
  [Console]::OutputEncoding = New-Object System.Text.UTF8Encoding $False
}}
$OutputEncoding = [Console]::OutputEncoding
{command}
if (-not $? -and ($LASTEXITCODE -eq $null)) {{ exit 1 }}
exit $LASTEXITCODE
"#
    )
}

/// Create a randomly named directory under `parent` and print its path
///
/// `parent` is a PowerShell expression, not a literal.
#[must_use]
pub fn make_tmpdir(parent: &str) -> String {
    format!(
        r"$parent = {parent}
$name = [System.IO.Path]::GetRandomFileName()
$path = Join-Path $parent $name -ErrorAction Stop
New-Item -ItemType Directory -Path $path -ErrorAction Stop | Out-Null
$path
"
    )
}

#[must_use]
pub fn rmdir(dir: &str) -> String {
    format!("Remove-Item -Force -Recurse -Path {}\n", quote_string(dir))
}

#[must_use]
pub fn mkdirs(dirs: &[String]) -> String {
    let quoted: Vec<String> = dirs.iter().map(|d| quote_string(d)).collect();
    format!("New-Item -ItemType Directory -Force -Path {} | Out-Null\n", quoted.join(","))
}

/// Invoke a `.ps1` script in-process with positional arguments
#[must_use]
pub fn run_script(arguments: &[String], script_path: &str) -> String {
    let argument_list: Vec<String> = arguments
        .iter()
        .map(|a| format!("$invokeArgs.ArgumentList += {}", here_string(a)))
        .collect();
    format!(
        r"$invokeArgs = @{{
  ScriptBlock = (Get-Command {path}).ScriptBlock
  ArgumentList = @()
}}
{arguments}

try
{{
  Invoke-Command @invokeArgs
}}
catch
{{
  Write-Error $_.Exception
  exit 1
}}
",
        path = quote_string(script_path),
        arguments = argument_list.join("\n"),
    )
}

/// Call a `.ps1` task with its parameters splatted as named arguments
///
/// Parameters the script does not declare are dropped.
#[must_use]
pub fn ps_task(path: &str, arguments: &Map<String, Value>) -> String {
    let encoded = STANDARD.encode(Value::Object(arguments.clone()).to_string());
    format!(
        r#"$private:tempArgs = Get-ContentAsJson (
  [System.Text.Encoding]::UTF8.GetString([System.Convert]::FromBase64String('{encoded}'))
)
$allowedArgs = (Get-Command {path}).Parameters.Keys
$private:taskArgs = @{{}}
$private:tempArgs.Keys | ? {{ $allowedArgs -contains $_ }} | % {{ $private:taskArgs[$_] = $private:tempArgs[$_] }}
try {{
  & {path} @taskArgs
}} catch {{
  $Host.UI.WriteErrorLine("[$($_.FullyQualifiedErrorId)] Exception $($_.InvocationInfo.PositionMessage).`n$($_.Exception.Message)");
  exit 1;
}}
"#,
        path = quote_string(path),
    )
}

#[must_use]
pub fn try_catch(path: &str) -> String {
    format!(
        "try {{ & {} }} catch {{ Write-Error $_.Exception; exit 1 }}\n",
        quote_string(path)
    )
}

#[must_use]
pub fn set_env(name: &str, value: &str) -> String {
    format!(
        "[Environment]::SetEnvironmentVariable({}, {})\n",
        quote_string(name),
        here_string(value)
    )
}

/// Helpers every task script starts with
pub const SHELL_INIT: &str = r"function ConvertFrom-PSCustomObject
{
PARAM([Parameter(ValueFromPipeline = $true)] $InputObject)
PROCESS {
  if ($null -eq $InputObject) { return $null }
  if ($InputObject -is [System.Collections.IEnumerable] -and $InputObject -isnot [string]) {
    $collection = @(
      foreach ($object in $InputObject) { ConvertFrom-PSCustomObject $object }
    )

    $collection
  } elseif ($InputObject -is [System.Management.Automation.PSCustomObject]) {
    $hash = @{}
    foreach ($property in $InputObject.PSObject.Properties) {
      $hash[$property.Name] = ConvertFrom-PSCustomObject $property.Value
    }

    $hash
  } else {
    $InputObject
  }
}
}

function Get-ContentAsJson
{
[CmdletBinding()]
PARAM(
  [Parameter(Mandatory = $true)] $Text,
  [Parameter(Mandatory = $false)] [Text.Encoding] $Encoding = [Text.Encoding]::UTF8
)

$Text | ConvertFrom-Json | ConvertFrom-PSCustomObject
}
";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_string_doubles_quotes() {
        assert_eq!(quote_string("it's"), "'it''s'");
        assert_eq!(quote_string(r"C:\Temp\a b"), r"'C:\Temp\a b'");
    }

    #[test]
    fn test_ps_task_embeds_base64_arguments() {
        let args = json!({"name": "world"});
        let script = ps_task(r"C:\t\hello.ps1", args.as_object().unwrap());
        let encoded = STANDARD.encode(r#"{"name":"world"}"#);
        assert!(script.contains(&encoded));
        assert!(script.contains(r"& 'C:\t\hello.ps1' @taskArgs"));
    }

    #[test]
    fn test_run_script_arguments() {
        let script = run_script(&["one".into(), "two words".into()], r"C:\t\s.ps1");
        assert!(script.contains("$invokeArgs.ArgumentList += @'\none\n'@"));
        assert!(script.contains("$invokeArgs.ArgumentList += @'\ntwo words\n'@"));
    }

    #[test]
    fn test_set_env() {
        assert_eq!(
            set_env("PT_message", "hi"),
            "[Environment]::SetEnvironmentVariable('PT_message', @'\nhi\n'@)\n"
        );
    }
}
