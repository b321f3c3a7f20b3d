use wideworlds_events::codes;

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `/lz`: teleport to the world's landing zone (entry point).
    LandingZone,
    /// `/gz`: teleport to ground zero, the world origin.
    GroundZero,
    /// `/tp [x [y [z [yaw_deg]]]]` with graceful arity: two values mean
    /// x and z, three mean x y z, four add the yaw in degrees.
    Teleport {
        x: f64,
        y: Option<f64>,
        z: f64,
        yaw_deg: Option<f32>,
    },
    /// `/seed [model]`: place a prop at the user position.
    Seed { model: Option<String> },
    GetPos,
    WorldData,
    Walk(f32),
    Run(f32),
    ResetWalk,
    ResetRun,
}

/// Parse one chat line. `None` means the line is not a command (no
/// leading slash, or the `//` escape). `Err` carries the symbolic code
/// for the user feed.
pub fn parse_command(input: &str) -> Option<Result<Command, &'static str>> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') || trimmed.starts_with("//") {
        return None;
    }
    let mut parts = trimmed[1..].split_whitespace();
    let name = parts.next().unwrap_or("");
    let args: Vec<&str> = parts.collect();

    let parsed = match name {
        "lz" => Ok(Command::LandingZone),
        "gz" => Ok(Command::GroundZero),
        "tp" => parse_teleport(&args),
        "seed" => Ok(Command::Seed {
            model: args.first().map(|s| s.to_string()),
        }),
        "getpos" => Ok(Command::GetPos),
        "worlddata" => Ok(Command::WorldData),
        "walk" => parse_speed(&args).map(Command::Walk),
        "run" => parse_speed(&args).map(Command::Run),
        "resetwalk" => Ok(Command::ResetWalk),
        "resetrun" => Ok(Command::ResetRun),
        _ => Err(codes::ERR_INVALID_COMMAND),
    };
    Some(parsed)
}

fn parse_teleport(args: &[&str]) -> Result<Command, &'static str> {
    if args.len() < 2 {
        return Err(codes::ERR_TOO_FEW_ARGUMENTS);
    }
    let taken = &args[..args.len().min(4)];
    let values: Vec<Result<f64, _>> = taken.iter().map(|s| s.parse::<f64>()).collect();
    let failures = values.iter().filter(|v| v.is_err()).count();
    match failures {
        0 => {}
        1 => return Err(codes::ERR_INVALID_VALUE),
        _ => return Err(codes::ERR_INVALID_VALUES),
    }
    let values: Vec<f64> = values.into_iter().map(|v| v.unwrap_or(0.0)).collect();

    let (x, y, z, yaw_deg) = match values.len() {
        2 => (values[0], None, values[1], None),
        3 => (values[0], Some(values[1]), values[2], None),
        _ => (values[0], Some(values[1]), values[2], Some(values[3] as f32)),
    };
    if let Some(yaw) = yaw_deg {
        if yaw < 0.0 {
            return Err(codes::ERR_NEGATIVE_YAW);
        }
    }
    Ok(Command::Teleport { x, y, z, yaw_deg })
}

fn parse_speed(args: &[&str]) -> Result<f32, &'static str> {
    let Some(raw) = args.first() else {
        return Err(codes::ERR_TOO_FEW_ARGUMENTS);
    };
    match raw.parse::<f32>() {
        Ok(speed) if speed > 0.0 => Ok(speed),
        _ => Err(codes::ERR_INVALID_VALUE),
    }
}
