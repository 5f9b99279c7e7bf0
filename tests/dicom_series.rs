use dicom::{
    core::{DataElement, PrimitiveValue, VR, dicom_value},
    object::{FileMetaTableBuilder, InMemDicomObject},
};
use dicom_dictionary_std::{tags, uids};
use dicom_voxelize::{
    Aggregation, EngineConfig, VoxelizeError, VoxelizeRequest,
    slice::{DicomSliceDecoder, SliceDecoder},
    voxelize,
};
use std::path::Path;
use tempfile::TempDir;

/// Write a 2-row CT slice whose pixel at column `c` holds `base + c`.
fn write_slice(path: &Path, index: u16, columns: u16, z: f64, base: u16) {
    let rows = 2_u16;
    let pixels: Vec<u16> = (0..rows)
        .flat_map(|_| (0..columns).map(move |c| base + c))
        .collect();
    let instance_uid = format!("2.25.1000{index}");

    let object = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(uids::CT_IMAGE_STORAGE),
        ),
        DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(instance_uid.as_str()),
        ),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
        DataElement::new(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            PrimitiveValue::from(format!("0\\0\\{z}")),
        ),
        DataElement::new(tags::PIXEL_SPACING, VR::DS, PrimitiveValue::from("1\\1")),
        DataElement::new(tags::SLICE_THICKNESS, VR::DS, PrimitiveValue::from("1")),
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, dicom_value!(U16, [1])),
        DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            PrimitiveValue::from("MONOCHROME2"),
        ),
        DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [rows])),
        DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [columns])),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [16])),
        DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [16])),
        DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, [15])),
        DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, dicom_value!(U16, [0])),
        DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(pixels.into())),
    ]);

    let file_object = object
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(instance_uid.as_str()),
        )
        .unwrap();
    file_object.write_to_file(path).unwrap();
}

#[test]
fn decodes_geometry_and_pixels() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ct.dcm");
    write_slice(&path, 0, 3, 12.5, 100);

    let slice = DicomSliceDecoder.decode(&path).unwrap();
    assert_eq!((slice.width(), slice.height()), (3, 2));
    assert_eq!(slice.spacing(), (1.0, 1.0));
    assert_eq!(slice.position(), [0.0, 0.0, 12.5]);
    assert_eq!(slice.thickness(), 1.0);
    assert_eq!(slice.pixels()[[1, 2]], 102.0);
}

#[test]
fn voxelizes_dicom_directory_and_skips_other_files() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("series");
    std::fs::create_dir(&input).unwrap();
    for (i, base) in [(0_u16, 10_u16), (1, 20), (2, 30)] {
        write_slice(&input.join(format!("IM{i}.dcm")), i, 3, i as f64, base);
    }
    std::fs::write(input.join("DICOMDIR.txt"), "index").unwrap();

    let output = temp_dir.path().join("means.png");
    let request = VoxelizeRequest {
        input_dir: input,
        output_file: output.clone(),
        voxel_size: [1.0, 2.0, 3.0],
        aggregation: Aggregation::Mean,
    };
    let summary = voxelize(&request, &EngineConfig::default()).unwrap();
    assert_eq!(summary.slices, 3);
    assert_eq!(summary.grid_dims, (3, 1, 1));

    // Column means are 20, 21 and 22.
    let image = image::open(&output).unwrap();
    let luma = image.as_luma16().expect("16-bit grayscale");
    assert_eq!(luma.as_raw(), &vec![0, 32768, 65535]);
}

#[test]
fn wider_slice_is_reported_by_file() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("series");
    std::fs::create_dir(&input).unwrap();
    write_slice(&input.join("a.dcm"), 0, 3, 0.0, 1);
    write_slice(&input.join("b.dcm"), 1, 4, 1.0, 1);
    write_slice(&input.join("c.dcm"), 2, 3, 2.0, 1);

    let request = VoxelizeRequest {
        input_dir: input.clone(),
        output_file: temp_dir.path().join("out.png"),
        voxel_size: [1.0, 1.0, 1.0],
        aggregation: Aggregation::StdDev,
    };
    let err = voxelize(&request, &EngineConfig::default()).unwrap_err();
    match err {
        VoxelizeError::InconsistentGeometry { path, .. } => assert_eq!(path, input.join("b.dcm")),
        other => panic!("unexpected error {other:?}"),
    }
}
