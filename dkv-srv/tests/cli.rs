#[cfg(test)]
mod test {
    use assert_cmd::prelude::*;
    use predicates::prelude::*;
    use std::process::Command;

    #[test]
    fn help_lists_options() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("dkv-srv")?;

        cmd.arg("--help");
        cmd.assert()
            .success()
            .stdout(predicate::str::contains("Configuration file path"))
            .stdout(predicate::str::contains("--listen-addr"));

        Ok(())
    }

    #[test]
    fn version_flag() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("dkv-srv")?;

        cmd.arg("-V");
        cmd.assert().success().stdout(predicate::str::contains("dkv-srv"));

        Ok(())
    }

    #[test]
    fn unknown_role_fails() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut cmd = Command::cargo_bin("dkv-srv")?;

        cmd.env("HOME", dir.path());
        cmd.arg("--config").arg(dir.path().join("none.toml"));
        cmd.arg("--role").arg("overlord");
        cmd.assert().failure().stderr(predicate::str::contains("unknown role"));

        Ok(())
    }

    #[test]
    fn unexpected_positional_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("dkv-srv")?;

        cmd.arg("foobar");
        cmd.assert().failure();

        Ok(())
    }
}
