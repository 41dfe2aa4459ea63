use assert_cmd::Command;

pub fn agentbridge_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("agentbridge").expect("agentbridge test binary should build")
    }
}
