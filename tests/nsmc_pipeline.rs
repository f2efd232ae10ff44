use std::fs;
use std::path::Path;

use approx::assert_relative_eq;
use pest_nsmc::config::IoPair;
use pest_nsmc::{
    ControlFile, DrawOptions, EngineState, LabeledMatrix, MonteCarlo, NsmcError, RunConfig,
};

fn write(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

fn parval1(text: &str, name: &str) -> f64 {
    let line = text
        .lines()
        .find(|l| l.trim_start().starts_with(&format!("{name} ")))
        .unwrap();
    line.split_whitespace().nth(3).unwrap().parse().unwrap()
}

fn fixture(dir: &Path) -> (Vec<IoPair>, Vec<IoPair>, std::path::PathBuf) {
    let tpl = write(
        dir,
        "model.tpl",
        "ptf #\nhk = #K1# #k2#\nrech = #k3#\nhk_again = #k1#\n",
    );
    let ins = write(
        dir,
        "model.ins",
        "pif ~\nl1 ~,~ !h1!\nl1 w !dum! !h2!\nl1 [h3]1:10\n",
    );
    // h1 and h2 only see k1 + k2; k3 is invisible to the data
    let jco = write(
        dir,
        "model.jco.csv",
        "obs,k1,k2,k3\nh1,1.0,1.0,0.0\nh2,2.0,2.0,0.0\nh3,0.5,0.5,0.0\n",
    );
    let templates = vec![IoPair {
        pest_file: tpl,
        model_file: dir.join("model.in"),
    }];
    let instructions = vec![IoPair {
        pest_file: ins,
        model_file: dir.join("model.out"),
    }];
    (templates, instructions, jco)
}

#[test]
fn builds_control_file_from_model_io_files() {
    let dir = tempfile::tempdir().unwrap();
    let (templates, instructions, _) = fixture(dir.path());
    let pst = ControlFile::from_io_files(&templates, &instructions).unwrap();

    assert_eq!(pst.par_names(), vec!["k1", "k2", "k3"]);
    assert_eq!(pst.obs_names(), vec!["h1", "h2", "h3"]);
}

#[test]
fn missing_template_is_reported_before_parsing() {
    let dir = tempfile::tempdir().unwrap();
    let (mut templates, instructions, _) = fixture(dir.path());
    templates[0].pest_file = dir.path().join("absent.tpl");
    let err = ControlFile::from_io_files(&templates, &instructions).unwrap_err();
    assert!(matches!(err, NsmcError::MissingFile(_)));
}

#[test]
fn draw_project_write_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (templates, instructions, jco) = fixture(dir.path());
    let mut pst = ControlFile::from_io_files(&templates, &instructions).unwrap();
    for p in &mut pst.parameter_data {
        p.parval1 = 2.0;
        p.parlbnd = 0.02;
        p.parubnd = 200.0;
    }

    let jco = LabeledMatrix::from_csv(&jco).unwrap();
    let mut mc = MonteCarlo::new(pst).unwrap().with_seed(1).with_jacobian(&jco).unwrap();
    assert_eq!(mc.get_nsing(None).unwrap(), 1);

    mc.draw(DrawOptions {
        num_reals: 5,
        obs: true,
        enforce_bounds: true,
        ..DrawOptions::default()
    })
    .unwrap();
    mc.project_parensemble(None, None, true).unwrap();
    assert_eq!(mc.state(), EngineState::Projected);

    // the resolved combination k1 + k2 (in log space) stays at its reference
    let reference = 2.0f64.log10();
    for row in mc.parensemble().values().row_iter() {
        assert_relative_eq!(row[0] + row[1], 2.0 * reference, epsilon = 1e-9);
    }

    let outdir = dir.path().join("out");
    fs::create_dir_all(&outdir).unwrap();
    let prefix = outdir.join("r").display().to_string();
    let paths = mc.write_psts(&prefix).unwrap();
    assert_eq!(paths.len(), 5);

    let model = mc.parensemble().back_transform();
    for (i, path) in paths.iter().enumerate() {
        assert_eq!(*path, outdir.join(format!("r{i}.pst")));
        let text = fs::read_to_string(path).unwrap();
        assert!(text.starts_with("pcf\n"));
        for (j, name) in ["k1", "k2", "k3"].iter().enumerate() {
            assert_relative_eq!(parval1(&text, name), model[(i, j)], max_relative = 1e-6);
        }
    }
    assert!(!outdir.join("r5.pst").exists());
}

#[test]
fn run_config_resolves_relative_paths() {
    let dir = tempfile::tempdir().unwrap();
    fixture(dir.path());
    let config = write(
        dir.path(),
        "nsmc.toml",
        r#"
num_reals = 3
jacobian = "model.jco.csv"
outdir = "out"

[[templates]]
pest_file = "model.tpl"
model_file = "model.in"

[[instructions]]
pest_file = "model.ins"
model_file = "model.out"
"#,
    );
    let cfg = RunConfig::from_toml_file(&config).unwrap();
    assert_eq!(cfg.num_reals, 3);
    assert_eq!(cfg.seed, 2016);
    assert_eq!(cfg.templates[0].pest_file, dir.path().join("model.tpl"));
    assert_eq!(cfg.outdir, dir.path().join("out"));
    assert_eq!(cfg.jacobian.as_deref(), Some(dir.path().join("model.jco.csv").as_path()));
}
