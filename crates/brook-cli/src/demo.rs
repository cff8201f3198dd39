//! Bus telemetry demo model
//!
//! City buses report their position; the model derives the direction of
//! travel from consecutive positions and republishes location, direction,
//! and brigade reports.

use brook_core::{FieldType, Value};
use brook_runtime::model::{
    CompileError, DerivedField, InputReport, Model, OutputReport, SchemaMeta,
};

pub fn model() -> Result<Model, CompileError> {
    let mut model = Model::new();

    let vehicle = model.input(
        InputReport::new("vehicle-report", "vehicle_number")
            .field("vehicle_number", FieldType::Integer)
            .field("time", FieldType::String)
            .field("lat", FieldType::Float)
            .field("lon", FieldType::Float)
            .field("line", FieldType::String)
            .field("brigade", FieldType::String),
    )?;
    let lat = vehicle.field("lat")?;
    let lon = vehicle.field("lon")?;

    let direction = model.derived(
        DerivedField::new("direction", FieldType::Float)
            .current("lat", lat.clone())
            .current("lon", lon.clone())
            .history("lat_history", lat.clone(), 1)
            .history("lon_history", lon.clone(), 1),
        |ctx| async move {
            let lat = ctx.float("lat")?;
            let lon = ctx.float("lon")?;
            let prev_lat = ctx.history("lat_history")?[0].as_float();
            let prev_lon = ctx.history("lon_history")?[0].as_float();
            match (prev_lat, prev_lon) {
                (Some(prev_lat), Some(prev_lon)) => Ok(Value::Float(
                    (lon - prev_lon).atan2(lat - prev_lat).to_degrees(),
                )),
                _ => Ok(Value::Null),
            }
        },
    )?;

    model.output(
        OutputReport::new("location-report")
            .field("vehicle_number", vehicle.field("vehicle_number")?)
            .field("lat", lat)
            .field("lon", lon)
            .field("line", vehicle.field("line")?)
            .field("time", vehicle.field("time")?)
            .field("brigade", vehicle.field("brigade")?),
    )?;
    model.output(OutputReport::new("direction-report").field("direction", direction))?;
    model.output(
        OutputReport::new("brigade-report").field("brigade", vehicle.field("brigade")?),
    )?;

    model.set_meta(
        SchemaMeta::new()
            .latitude("location-report", "lat")
            .longitude("location-report", "lon")
            .time("location-report", "time")
            .group("location-report", "line")
            .direction("direction-report", "direction"),
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_model_compiles() {
        let compiled = model().unwrap().compile().unwrap();
        assert_eq!(compiled.splitters.len(), 1);
        assert_eq!(compiled.generators.len(), 1);
        assert_eq!(compiled.resolvers.len(), 3);
        assert_eq!(compiled.schema.streams.len(), 3);
        assert!(compiled.schema.direction_field.is_some());
    }
}
